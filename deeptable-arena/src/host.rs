use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use deeptable_error::{DeeptableResult, deeptable_bail};
use parking_lot::RwLock;

use crate::{BackingStore, BufferLocation};

/// A backing buffer that lives in host memory.
#[derive(Clone)]
pub struct HostBuffer {
    id: usize,
    data: Arc<RwLock<Vec<u8>>>,
}

impl HostBuffer {
    /// The store-unique identifier of this buffer.
    pub fn id(&self) -> usize {
        self.id
    }

    /// The size of the buffer in bytes.
    pub fn byte_size(&self) -> usize {
        self.data.read().len()
    }

    /// Copy `len` bytes starting at `offset` out of the buffer.
    pub fn read(&self, offset: usize, len: usize) -> DeeptableResult<Bytes> {
        let data = self.data.read();
        let Some(slice) = data.get(offset..offset + len) else {
            deeptable_bail!(
                "range {}..{} out of bounds for host buffer of {} bytes",
                offset,
                offset + len,
                data.len()
            );
        };
        Ok(Bytes::copy_from_slice(slice))
    }
}

impl Debug for HostBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBuffer")
            .field("id", &self.id)
            .field("byte_size", &self.byte_size())
            .finish()
    }
}

/// A [`BackingStore`] that keeps every backing buffer in host memory.
///
/// Useful for headless consumers and for tests; writes complete immediately.
#[derive(Debug, Default)]
pub struct HostStore {
    next_id: AtomicUsize,
}

#[async_trait]
impl BackingStore for HostStore {
    type Buffer = HostBuffer;

    fn create_buffer(&self, byte_size: usize) -> DeeptableResult<HostBuffer> {
        Ok(HostBuffer {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            data: Arc::new(RwLock::new(vec![0; byte_size])),
        })
    }

    async fn write(&self, location: &BufferLocation<HostBuffer>, data: Bytes) -> DeeptableResult<()> {
        if data.len() > location.byte_size {
            deeptable_bail!(
                Allocation: "cannot write {} bytes into a block of {} bytes",
                data.len(),
                location.byte_size
            );
        }
        let mut buffer = location.buffer.data.write();
        let Some(dst) = buffer.get_mut(location.offset..location.offset + data.len()) else {
            deeptable_bail!(
                Allocation: "block at offset {} lies outside its backing buffer",
                location.offset
            );
        };
        dst.copy_from_slice(&data);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use bytes::Bytes;
    use futures::executor::block_on;

    use crate::{BackingStore, BufferArena, BufferArenaOptions, HostStore};

    #[test]
    fn write_then_read() {
        let store = Arc::new(HostStore::default());
        let mut arena = BufferArena::new(
            store.clone(),
            BufferArenaOptions::default().with_buffer_size(128).unwrap(),
        );
        let _pad = arena.allocate_block(3, 4).unwrap();
        let location = arena.allocate_block(2, 4).unwrap();

        let payload = Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]);
        block_on(store.write(&location, payload.clone())).unwrap();

        assert_eq!(location.buffer.read(location.offset, 8).unwrap(), payload);
        assert_eq!(location.buffer.read(0, 4).unwrap(), Bytes::from_static(&[0; 4]));
    }

    #[test]
    fn oversized_write_fails() {
        let store = Arc::new(HostStore::default());
        let mut arena = BufferArena::new(store.clone(), BufferArenaOptions::default());
        let location = arena.allocate_block(1, 4).unwrap();
        let result = block_on(store.write(&location, Bytes::from_static(&[0; 8])));
        assert!(result.is_err());
    }

    #[test]
    fn buffers_have_distinct_ids() {
        let store = HostStore::default();
        let a = store.create_buffer(8).unwrap();
        let b = store.create_buffer(8).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.byte_size(), 8);
    }
}
