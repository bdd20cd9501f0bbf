use crate::Bitmask;

impl Bitmask {
    /// Iterate the indices of the set bits, in ascending order.
    pub fn set_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.buffer().set_indices()
    }

    /// Iterate the value of every bit.
    pub fn iter_bools(&self) -> impl Iterator<Item = bool> + '_ {
        self.buffer().iter()
    }
}

#[cfg(test)]
mod test {
    use crate::Bitmask;

    #[test]
    fn set_indices_across_bytes() {
        let mask = Bitmask::from_indices(30, [0, 7, 8, 15, 29]);
        assert_eq!(mask.set_indices().collect::<Vec<_>>(), vec![0, 7, 8, 15, 29]);
    }

    #[test]
    fn set_indices_empty() {
        assert_eq!(Bitmask::new_false(0).set_indices().count(), 0);
        assert_eq!(Bitmask::new_false(17).set_indices().count(), 0);
    }

    #[test]
    fn iter_bools_roundtrips() {
        let values = [true, false, false, true, true, false, true, false, true];
        let mask = Bitmask::from_iter(values);
        assert_eq!(mask.iter_bools().collect::<Vec<_>>(), values);
    }
}
