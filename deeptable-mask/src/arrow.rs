use arrow_array::{Array, BooleanArray};
use arrow_buffer::BooleanBuffer;

use crate::Bitmask;

impl Bitmask {
    /// Return the mask as an Arrow [`BooleanBuffer`].
    pub fn to_boolean_buffer(&self) -> BooleanBuffer {
        self.buffer().clone()
    }

    /// Return the mask as a non-nullable Arrow [`BooleanArray`], the column representation of a
    /// selection.
    pub fn to_boolean_array(&self) -> BooleanArray {
        BooleanArray::new(self.to_boolean_buffer(), None)
    }

    /// Create a mask from an Arrow [`BooleanBuffer`], which may have a non-zero bit offset.
    pub fn from_boolean_buffer(buffer: &BooleanBuffer) -> Self {
        Self::from_buffer(buffer.clone())
    }

    /// Create a mask from an Arrow [`BooleanArray`]. Null rows are treated as unset.
    pub fn from_boolean_array(array: &BooleanArray) -> Self {
        match array.nulls() {
            Some(nulls) => Self::from_buffer(array.values() & nulls.inner()),
            None => Self::from_boolean_buffer(array.values()),
        }
    }
}

impl From<&BooleanArray> for Bitmask {
    fn from(value: &BooleanArray) -> Self {
        Self::from_boolean_array(value)
    }
}

impl From<&Bitmask> for BooleanArray {
    fn from(value: &Bitmask) -> Self {
        value.to_boolean_array()
    }
}
