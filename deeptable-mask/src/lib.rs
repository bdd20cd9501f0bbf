//! A bitmask is a packed vector of booleans, one bit per row.
//!
//! Bitmasks back the materialized column of every data selection. They support point updates
//! and the usual set algebra, where every binary operation returns a new mask.
#![deny(missing_docs)]
mod arrow;
mod bitops;
mod iter;

use std::fmt::{Debug, Formatter};

use arrow_buffer::{BooleanBuffer, BooleanBufferBuilder, bit_util};
use deeptable_error::deeptable_panic;

/// A packed boolean vector of a fixed length, stored as an Arrow [`BooleanBuffer`].
///
/// Equality compares the logical bits only, so masks built from buffers with different offsets
/// or trailing padding compare equal when their rows agree.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmask {
    buffer: BooleanBuffer,
}

impl Bitmask {
    /// Create a new mask of `len` rows where no bits are set.
    pub fn new_false(len: usize) -> Self {
        Self::from_buffer(BooleanBuffer::new_unset(len))
    }

    /// Create a new mask of `len` rows where every bit is set.
    pub fn new_true(len: usize) -> Self {
        Self::from_buffer(BooleanBuffer::new_set(len))
    }

    /// Wrap an existing [`BooleanBuffer`].
    #[inline]
    pub fn from_buffer(buffer: BooleanBuffer) -> Self {
        Self { buffer }
    }

    /// Create a mask by evaluating `f` for every row.
    pub fn from_fn(len: usize, mut f: impl FnMut(usize) -> bool) -> Self {
        let mut builder = BooleanBufferBuilder::new(len);
        for idx in 0..len {
            builder.append(f(idx));
        }
        Self::from_buffer(builder.finish())
    }

    /// Create a mask with exactly the given row indices set.
    ///
    /// ## Panics
    ///
    /// Panics if any index is out of bounds.
    pub fn from_indices(len: usize, indices: impl IntoIterator<Item = usize>) -> Self {
        let mut builder = BooleanBufferBuilder::new(len);
        builder.append_n(len, false);
        for idx in indices {
            if idx >= len {
                deeptable_panic!("Bitmask index {idx} out of bounds for length {len}");
            }
            builder.set_bit(idx, true);
        }
        Self::from_buffer(builder.finish())
    }

    /// Returns the number of rows in the mask (not the number of set bits).
    #[inline]
    // As with Arrow buffers, is_empty would be ambiguous between len == 0 and true_count == 0.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the underlying [`BooleanBuffer`].
    #[inline]
    pub fn buffer(&self) -> &BooleanBuffer {
        &self.buffer
    }

    /// Consume the mask, returning its [`BooleanBuffer`].
    pub fn into_buffer(self) -> BooleanBuffer {
        self.buffer
    }

    /// Returns the value of the bit at `idx`.
    ///
    /// ## Panics
    ///
    /// Panics if the index is out of bounds.
    #[inline]
    pub fn get(&self, idx: usize) -> bool {
        self.check_bounds(idx);
        self.buffer.value(idx)
    }

    /// Set the bit at `idx`.
    pub fn set(&mut self, idx: usize) {
        self.update(idx, true);
    }

    /// Clear the bit at `idx`.
    pub fn unset(&mut self, idx: usize) {
        self.update(idx, false);
    }

    /// Returns the number of set bits.
    pub fn true_count(&self) -> usize {
        self.buffer.count_set_bits()
    }

    /// Returns the number of unset bits.
    pub fn false_count(&self) -> usize {
        self.len() - self.true_count()
    }

    /// Returns true if every bit is set.
    pub fn all_true(&self) -> bool {
        self.true_count() == self.len()
    }

    /// Returns true if no bit is set.
    pub fn all_false(&self) -> bool {
        self.true_count() == 0
    }

    /// Returns the first set index, if any.
    pub fn first(&self) -> Option<usize> {
        self.set_indices().next()
    }

    /// Returns the index of the `n`-th set bit (zero based), if the mask has that many.
    pub fn nth_set(&self, n: usize) -> Option<usize> {
        self.set_indices().nth(n)
    }

    #[inline(always)]
    fn check_bounds(&self, idx: usize) {
        if idx >= self.len() {
            deeptable_panic!("Bitmask index {idx} out of bounds for length {}", self.len());
        }
    }

    /// Flip one bit in place when the bytes are not shared with another mask, else copy them.
    fn update(&mut self, idx: usize, value: bool) {
        self.check_bounds(idx);
        let buffer = std::mem::replace(&mut self.buffer, BooleanBuffer::new_unset(0));
        let (offset, len) = (buffer.offset(), buffer.len());
        self.buffer = match buffer.into_inner().into_mutable() {
            Ok(mut bytes) => {
                if value {
                    bit_util::set_bit(bytes.as_slice_mut(), offset + idx);
                } else {
                    bit_util::unset_bit(bytes.as_slice_mut(), offset + idx);
                }
                BooleanBuffer::new(bytes.into(), offset, len)
            }
            Err(shared) => {
                let mut builder = BooleanBufferBuilder::new(len);
                builder.append_buffer(&BooleanBuffer::new(shared, offset, len));
                builder.set_bit(idx, value);
                builder.finish()
            }
        };
    }
}

impl Debug for Bitmask {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitmask")
            .field("len", &self.len())
            .field("true_count", &self.true_count())
            .finish()
    }
}

impl FromIterator<bool> for Bitmask {
    fn from_iter<T: IntoIterator<Item = bool>>(iter: T) -> Self {
        let iter = iter.into_iter();
        let mut builder = BooleanBufferBuilder::new(iter.size_hint().0);
        for value in iter {
            builder.append(value);
        }
        Self::from_buffer(builder.finish())
    }
}

impl From<BooleanBuffer> for Bitmask {
    fn from(value: BooleanBuffer) -> Self {
        Self::from_buffer(value)
    }
}
