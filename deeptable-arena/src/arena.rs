use std::collections::HashMap;
use std::sync::Arc;

use deeptable_error::{DeeptableResult, deeptable_bail, deeptable_err};

use crate::{BLOCK_ALIGNMENT, BackingStore, BufferLocation, DEFAULT_BUFFER_SIZE};

/// Sizing options for a [`BufferArena`].
#[derive(Debug, Clone)]
pub struct BufferArenaOptions {
    buffer_size: usize,
    max_buffers: Option<usize>,
}

impl Default for BufferArenaOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_buffers: None,
        }
    }
}

impl BufferArenaOptions {
    /// The size in bytes of every backing buffer, must be greater than 0.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> DeeptableResult<Self> {
        if buffer_size == 0 {
            deeptable_bail!(InvalidArgument: "backing buffers must hold at least one byte");
        }
        self.buffer_size = buffer_size;
        Ok(self)
    }

    /// Bound the number of backing buffers, and hence the total device memory.
    pub fn with_max_buffers(mut self, max_buffers: usize) -> Self {
        self.max_buffers = Some(max_buffers);
        self
    }

    /// The size in bytes of every backing buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// The maximum number of backing buffers, if bounded.
    pub fn max_buffers(&self) -> Option<usize> {
        self.max_buffers
    }
}

/// A released block waiting to be reused by a request of the same byte size.
#[derive(Debug)]
struct FreeBlock<B> {
    buffer: B,
    buffer_index: usize,
    offset: usize,
}

/// A pool of fixed-size backing buffers from which byte ranges are allocated and reused.
///
/// Allocation first looks for a released block of exactly the requested byte size. Otherwise it
/// bump-allocates from the tail of the current backing buffer. When the tail is too small, the
/// remainder is salvaged onto the free list and a new backing buffer is started.
///
/// The arena does not track whether a released block is still referenced elsewhere (for instance
/// by a pending draw call). Callers must only free blocks they are done with.
pub struct BufferArena<S: BackingStore> {
    store: Arc<S>,
    options: BufferArenaOptions,
    buffers: Vec<S::Buffer>,
    /// The first unused byte of the last backing buffer.
    tail: usize,
    free_list: HashMap<usize, Vec<FreeBlock<S::Buffer>>>,
    free_bytes: usize,
}

impl<S: BackingStore> BufferArena<S> {
    /// Create an empty arena. No backing buffer is allocated until the first request.
    pub fn new(store: Arc<S>, options: BufferArenaOptions) -> Self {
        Self {
            store,
            options,
            buffers: Vec::new(),
            tail: 0,
            free_list: HashMap::new(),
            free_bytes: 0,
        }
    }

    /// The store that backs this arena.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The sizing options of this arena.
    pub fn options(&self) -> &BufferArenaOptions {
        &self.options
    }

    /// Allocate a block holding `item_count` items of `bytes_per_item` bytes each.
    pub fn allocate_block(
        &mut self,
        item_count: usize,
        bytes_per_item: usize,
    ) -> DeeptableResult<BufferLocation<S::Buffer>> {
        let byte_size = item_count
            .checked_mul(bytes_per_item)
            .ok_or_else(|| {
                deeptable_err!(Allocation: "{} x {} bytes overflows", item_count, bytes_per_item)
            })?;
        if byte_size > self.options.buffer_size {
            deeptable_bail!(
                Allocation: "block of {} bytes exceeds the backing buffer size of {} bytes",
                byte_size,
                self.options.buffer_size
            );
        }

        if let Some(block) = self.take_free(byte_size) {
            log::trace!(
                "Reusing {} byte block at buffer {} offset {}",
                byte_size,
                block.buffer_index,
                block.offset
            );
            return Ok(BufferLocation {
                buffer: block.buffer,
                buffer_index: block.buffer_index,
                offset: block.offset,
                stride: bytes_per_item,
                byte_size,
            });
        }

        let mut offset = self.tail.next_multiple_of(BLOCK_ALIGNMENT);
        if self.buffers.is_empty() || offset + byte_size > self.options.buffer_size {
            self.seal_current();
            self.open_buffer()?;
            offset = 0;
        }
        self.tail = offset + byte_size;

        let buffer_index = self.buffers.len() - 1;
        Ok(BufferLocation {
            buffer: self.buffers[buffer_index].clone(),
            buffer_index,
            offset,
            stride: bytes_per_item,
            byte_size,
        })
    }

    /// Return a block to the free list. No coalescing with neighbouring blocks is performed.
    pub fn free_block(&mut self, location: BufferLocation<S::Buffer>) {
        self.push_free(
            location.byte_size,
            FreeBlock {
                buffer: location.buffer,
                buffer_index: location.buffer_index,
                offset: location.offset,
            },
        );
    }

    /// The number of backing buffers allocated so far.
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// The total number of bytes of backing storage allocated so far.
    pub fn total_bytes(&self) -> usize {
        self.buffers.len() * self.options.buffer_size
    }

    /// The number of bytes currently held on the free list.
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// The number of blocks currently held on the free list.
    pub fn free_block_count(&self) -> usize {
        self.free_list.values().map(Vec::len).sum()
    }

    fn take_free(&mut self, byte_size: usize) -> Option<FreeBlock<S::Buffer>> {
        let blocks = self.free_list.get_mut(&byte_size)?;
        let block = blocks.pop()?;
        if blocks.is_empty() {
            self.free_list.remove(&byte_size);
        }
        self.free_bytes -= byte_size;
        Some(block)
    }

    fn push_free(&mut self, byte_size: usize, block: FreeBlock<S::Buffer>) {
        self.free_bytes += byte_size;
        self.free_list.entry(byte_size).or_default().push(block);
    }

    /// Salvage the unused tail of the current backing buffer onto the free list.
    fn seal_current(&mut self) {
        let Some(buffer) = self.buffers.last() else {
            return;
        };
        let offset = self.tail.next_multiple_of(BLOCK_ALIGNMENT);
        if offset < self.options.buffer_size {
            let remainder = self.options.buffer_size - offset;
            let block = FreeBlock {
                buffer: buffer.clone(),
                buffer_index: self.buffers.len() - 1,
                offset,
            };
            self.push_free(remainder, block);
        }
        self.tail = self.options.buffer_size;
    }

    fn open_buffer(&mut self) -> DeeptableResult<()> {
        if let Some(max_buffers) = self.options.max_buffers {
            if self.buffers.len() >= max_buffers {
                deeptable_bail!(
                    Allocation: "arena is limited to {} backing buffers of {} bytes",
                    max_buffers,
                    self.options.buffer_size
                );
            }
        }
        let buffer = self.store.create_buffer(self.options.buffer_size)?;
        log::debug!(
            "Allocated backing buffer {} of {} bytes",
            self.buffers.len(),
            self.options.buffer_size
        );
        self.buffers.push(buffer);
        self.tail = 0;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use rstest::{fixture, rstest};

    use crate::{BufferArena, BufferArenaOptions, HostStore};

    #[fixture]
    fn arena() -> BufferArena<HostStore> {
        BufferArena::new(
            Arc::new(HostStore::default()),
            BufferArenaOptions::default().with_buffer_size(1024).unwrap(),
        )
    }

    #[rstest]
    fn freed_block_is_reused(mut arena: BufferArena<HostStore>) {
        let first = arena.allocate_block(10, 4).unwrap();
        let _second = arena.allocate_block(3, 8).unwrap();
        let total = arena.total_bytes();

        arena.free_block(first.clone());
        let reused = arena.allocate_block(20, 2).unwrap();

        assert!(reused.same_block(&first));
        assert_eq!(reused.stride, 2);
        assert_eq!(reused.item_count(), 20);
        assert_eq!(arena.total_bytes(), total);
        assert_eq!(arena.free_block_count(), 0);
    }

    #[rstest]
    fn bump_allocation_is_aligned(mut arena: BufferArena<HostStore>) {
        let a = arena.allocate_block(3, 1).unwrap();
        let b = arena.allocate_block(2, 4).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 8);
        assert_eq!(b.byte_range(), 8..16);
        assert_eq!(arena.buffer_count(), 1);
    }

    #[rstest]
    fn remainder_is_salvaged_when_buffer_overflows(mut arena: BufferArena<HostStore>) {
        let _a = arena.allocate_block(100, 8).unwrap();
        // 224 bytes remain in the first buffer, this request does not fit.
        let b = arena.allocate_block(300, 1).unwrap();
        assert_eq!(b.buffer_index, 1);
        assert_eq!(b.offset, 0);
        assert_eq!(arena.buffer_count(), 2);
        assert_eq!(arena.free_bytes(), 224);

        // An exact-size request picks up the salvaged remainder.
        let c = arena.allocate_block(224, 1).unwrap();
        assert_eq!(c.buffer_index, 0);
        assert_eq!(c.offset, 800);
        assert_eq!(arena.free_bytes(), 0);
    }

    #[rstest]
    fn oversized_blocks_fail(mut arena: BufferArena<HostStore>) {
        let err = arena.allocate_block(1025, 1).unwrap_err();
        assert!(matches!(err, deeptable_error::DeeptableError::Allocation(..)));
        assert_eq!(arena.buffer_count(), 0);
    }

    #[test]
    fn bounded_arena_runs_out() {
        let mut arena = BufferArena::new(
            Arc::new(HostStore::default()),
            BufferArenaOptions::default()
                .with_buffer_size(64)
                .unwrap()
                .with_max_buffers(1),
        );
        let block = arena.allocate_block(8, 8).unwrap();
        assert!(arena.allocate_block(1, 8).is_err());

        // Releasing the block makes room again without another backing buffer.
        arena.free_block(block);
        let again = arena.allocate_block(16, 4).unwrap();
        assert_eq!(again.offset, 0);
        assert_eq!(arena.buffer_count(), 1);
    }

    #[test]
    fn empty_buffers_are_rejected() {
        let err = BufferArenaOptions::default().with_buffer_size(0).unwrap_err();
        assert!(err.is_invalid_argument());
        assert_eq!(
            BufferArenaOptions::default().with_buffer_size(8).unwrap().buffer_size(),
            8
        );
    }
}
