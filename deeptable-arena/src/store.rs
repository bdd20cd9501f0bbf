use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use deeptable_error::DeeptableResult;

use crate::BufferLocation;

/// The allocator and uploader of backing buffers for a [`BufferArena`][crate::BufferArena].
///
/// Implementations wrap a device API: `create_buffer` allocates a backing buffer once, and
/// `write` stages bytes into a sub-range of it. Writes may complete asynchronously, for example
/// after mapping a GPU buffer.
#[async_trait]
pub trait BackingStore: Send + Sync + 'static {
    /// A cheaply cloneable handle to a backing buffer.
    type Buffer: Clone + Debug + Send + Sync + 'static;

    /// Allocate a new backing buffer of exactly `byte_size` bytes.
    fn create_buffer(&self, byte_size: usize) -> DeeptableResult<Self::Buffer>;

    /// Upload `data` into the given location. `data` must not exceed the location's byte size.
    async fn write(&self, location: &BufferLocation<Self::Buffer>, data: Bytes)
    -> DeeptableResult<()>;
}
