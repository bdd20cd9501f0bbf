use std::ops::{BitAnd, BitOr, BitXor, Not};

use deeptable_error::deeptable_panic;

use crate::Bitmask;

impl Bitmask {
    #[inline]
    fn check_same_len(&self, rhs: &Bitmask) {
        if self.len() != rhs.len() {
            deeptable_panic!(
                "Bitmasks must have the same length, got {} and {}",
                self.len(),
                rhs.len()
            );
        }
    }

    /// Rows set in both masks.
    pub fn and(&self, rhs: &Bitmask) -> Bitmask {
        self.check_same_len(rhs);
        Bitmask::from_buffer(self.buffer() & rhs.buffer())
    }

    /// Rows set in either mask.
    pub fn or(&self, rhs: &Bitmask) -> Bitmask {
        self.check_same_len(rhs);
        Bitmask::from_buffer(self.buffer() | rhs.buffer())
    }

    /// Rows set in exactly one of the masks.
    pub fn xor(&self, rhs: &Bitmask) -> Bitmask {
        self.check_same_len(rhs);
        Bitmask::from_buffer(self.buffer() ^ rhs.buffer())
    }

    /// Rows not set in this mask.
    pub fn not(&self) -> Bitmask {
        Bitmask::from_buffer(!self.buffer())
    }

    /// The union of one or more masks.
    ///
    /// ## Panics
    ///
    /// Panics if `masks` is empty or the lengths differ.
    pub fn any<'a>(masks: impl IntoIterator<Item = &'a Bitmask>) -> Bitmask {
        Self::reduce(masks, Bitmask::or)
    }

    /// The intersection of one or more masks.
    ///
    /// ## Panics
    ///
    /// Panics if `masks` is empty or the lengths differ.
    pub fn all<'a>(masks: impl IntoIterator<Item = &'a Bitmask>) -> Bitmask {
        Self::reduce(masks, Bitmask::and)
    }

    /// Rows set in none of the masks, i.e. the negated union.
    ///
    /// ## Panics
    ///
    /// Panics if `masks` is empty or the lengths differ.
    pub fn none<'a>(masks: impl IntoIterator<Item = &'a Bitmask>) -> Bitmask {
        Self::any(masks).not()
    }

    fn reduce<'a>(
        masks: impl IntoIterator<Item = &'a Bitmask>,
        op: impl Fn(&Bitmask, &Bitmask) -> Bitmask,
    ) -> Bitmask {
        let mut masks = masks.into_iter();
        let Some(first) = masks.next() else {
            deeptable_panic!("Cannot reduce an empty set of bitmasks");
        };
        masks.fold(first.clone(), |acc, mask| op(&acc, mask))
    }
}

impl BitAnd for &Bitmask {
    type Output = Bitmask;

    fn bitand(self, rhs: Self) -> Self::Output {
        self.and(rhs)
    }
}

impl BitOr for &Bitmask {
    type Output = Bitmask;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.or(rhs)
    }
}

impl BitXor for &Bitmask {
    type Output = Bitmask;

    fn bitxor(self, rhs: Self) -> Self::Output {
        self.xor(rhs)
    }
}

impl Not for &Bitmask {
    type Output = Bitmask;

    fn not(self) -> Self::Output {
        Bitmask::not(self)
    }
}
