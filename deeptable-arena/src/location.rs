use std::ops::Range;

/// A sub-range of a backing buffer handed out by a [`BufferArena`][crate::BufferArena].
#[derive(Debug, Clone)]
pub struct BufferLocation<B> {
    /// Handle to the backing buffer.
    pub buffer: B,
    /// The index of the backing buffer within its arena.
    pub buffer_index: usize,
    /// Byte offset of the block within the backing buffer.
    pub offset: usize,
    /// Bytes per item stored in the block.
    pub stride: usize,
    /// Size of the block in bytes.
    pub byte_size: usize,
}

impl<B> BufferLocation<B> {
    /// The byte range of the block within its backing buffer.
    pub fn byte_range(&self) -> Range<usize> {
        self.offset..self.offset + self.byte_size
    }

    /// The number of items that fit in the block.
    pub fn item_count(&self) -> usize {
        if self.stride == 0 {
            0
        } else {
            self.byte_size / self.stride
        }
    }

    /// Whether two locations refer to the same block of the same backing buffer.
    pub fn same_block<C>(&self, other: &BufferLocation<C>) -> bool {
        self.buffer_index == other.buffer_index
            && self.offset == other.offset
            && self.byte_size == other.byte_size
    }
}
