//! Staging tile columns into arena-backed device buffers.

use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use arrow_array::Array;
use dashmap::{DashMap, Entry};
use deeptable_arena::{BackingStore, BufferArena, BufferArenaOptions, BufferLocation};
use deeptable_error::{DeeptableResult, SharedDeeptableResult, SharedResultExt, deeptable_err};
use futures::channel::oneshot;
use futures::future::{BoxFuture, Shared, ready};
use futures::{FutureExt, TryFutureExt};
use parking_lot::Mutex;

use crate::coerce::to_f32_bytes;
use crate::metrics::{BLOCKS_ALLOCATED, BLOCKS_RELEASED, DeeptableMetrics};
use crate::tile::{Tile, TileId};

/// Every staged column is uploaded as little-endian `f32`.
const BYTES_PER_ITEM: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferKey {
    pub tile: TileId,
    pub column: Arc<str>,
}

impl BufferKey {
    pub fn new(tile: TileId, column: impl Into<Arc<str>>) -> Self {
        Self {
            tile,
            column: column.into(),
        }
    }
}

/// Point-in-time usage of the arena behind a [`TileBufferManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    pub buffer_count: usize,
    pub total_bytes: usize,
    pub free_bytes: usize,
    pub free_blocks: usize,
    pub staged_columns: usize,
}

/// Work that is postponed until the owner chooses to run it, typically once per frame.
#[derive(Default)]
pub struct DeferredQueue {
    jobs: Mutex<VecDeque<BoxFuture<'static, ()>>>,
}

impl DeferredQueue {
    pub fn push(&self, job: BoxFuture<'static, ()>) {
        self.jobs.lock().push_back(job);
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// Run queued jobs one after another until the queue is empty, including jobs queued while
    /// running. Returns the number of jobs run.
    pub async fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let Some(job) = self.jobs.lock().pop_front() else {
                return ran;
            };
            job.await;
            ran += 1;
        }
    }
}

type SharedLocation<B> = Shared<BoxFuture<'static, SharedDeeptableResult<BufferLocation<B>>>>;

/// Maps `(tile, column)` pairs to the arena blocks holding their `f32` data.
///
/// A column is staged at most once: while an upload is pending every request shares it, and
/// once it is done the location is returned directly until the column is released.
pub struct TileBufferManager<S: BackingStore> {
    arena: Mutex<BufferArena<S>>,
    store: Arc<S>,
    locations: DashMap<BufferKey, BufferLocation<S::Buffer>>,
    pending: DashMap<BufferKey, SharedLocation<S::Buffer>>,
    deferred: DeferredQueue,
    metrics: DeeptableMetrics,
}

impl<S: BackingStore> TileBufferManager<S> {
    pub fn new(store: Arc<S>, options: BufferArenaOptions, metrics: DeeptableMetrics) -> Self {
        Self {
            arena: Mutex::new(BufferArena::new(store.clone(), options)),
            store,
            locations: DashMap::new(),
            pending: DashMap::new(),
            deferred: DeferredQueue::default(),
            metrics,
        }
    }

    /// Whether the column of this tile is already staged.
    pub fn ready(&self, tile: TileId, column: &str) -> bool {
        self.locations.contains_key(&BufferKey::new(tile, column))
    }

    pub fn location(&self, tile: TileId, column: &str) -> Option<BufferLocation<S::Buffer>> {
        self.locations
            .get(&BufferKey::new(tile, column))
            .map(|location| location.value().clone())
    }

    /// Return the location of a staged column, staging it first if needed.
    ///
    /// Staging is deferred: the conversion and upload only happen when [`Self::run_pending`]
    /// is driven, and the returned future resolves after that.
    pub fn ready_or_not_here_it_comes(
        self: &Arc<Self>,
        tile: &Arc<Tile>,
        column: &str,
    ) -> BoxFuture<'static, DeeptableResult<BufferLocation<S::Buffer>>> {
        let key = BufferKey::new(tile.id(), column);
        if let Some(location) = self.locations.get(&key) {
            return ready(Ok(location.value().clone())).boxed();
        }

        let shared = match self.pending.entry(key.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                // The job stores the location before it clears its pending entry.
                if let Some(location) = self.locations.get(&key) {
                    return ready(Ok(location.value().clone())).boxed();
                }
                let (tx, rx) = oneshot::channel();
                let shared = rx
                    .map(|received| {
                        received.unwrap_or_else(|_| {
                            Err(Arc::new(deeptable_err!("staging was dropped")))
                        })
                    })
                    .boxed()
                    .shared();
                entry.insert(shared.clone());
                self.deferred.push(self.clone().stage_job(tile.clone(), key, tx));
                shared
            }
        };
        shared.map(SharedResultExt::unshare).boxed()
    }

    fn stage_job(
        self: Arc<Self>,
        tile: Arc<Tile>,
        key: BufferKey,
        tx: oneshot::Sender<SharedDeeptableResult<BufferLocation<S::Buffer>>>,
    ) -> BoxFuture<'static, ()> {
        async move {
            let result = self.stage(&tile, &key.column).map_err(Arc::new).await;
            match &result {
                Ok(location) => {
                    self.locations.insert(key.clone(), location.clone());
                }
                Err(err) => log::warn!(
                    "Staging column {} of tile {} failed: {}",
                    key.column,
                    tile.key(),
                    err
                ),
            }
            self.pending.remove(&key);
            // The receiver may have been dropped with every request.
            let _ = tx.send(result);
        }
        .boxed()
    }

    async fn stage(
        &self,
        tile: &Arc<Tile>,
        column: &str,
    ) -> DeeptableResult<BufferLocation<S::Buffer>> {
        let array = tile.get_column(column).await?;
        let bytes = to_f32_bytes(&array)?;
        let location = self.arena.lock().allocate_block(array.len(), BYTES_PER_ITEM)?;
        self.metrics.counter(BLOCKS_ALLOCATED).inc();
        log::trace!(
            "Staging {} bytes of {} for tile {} at buffer {} offset {}",
            bytes.len(),
            column,
            tile.key(),
            location.buffer_index,
            location.offset
        );
        if let Err(err) = self.store.write(&location, bytes).await {
            self.arena.lock().free_block(location);
            self.metrics.counter(BLOCKS_RELEASED).inc();
            return Err(err);
        }
        Ok(location)
    }

    /// Run every deferred staging job. Returns the number of jobs run.
    pub async fn run_pending(&self) -> usize {
        self.deferred.run_pending().await
    }

    pub fn pending_jobs(&self) -> usize {
        self.deferred.len()
    }

    /// Return the block of one column to the arena. The caller must no longer read from it.
    pub fn release(&self, tile: TileId, column: &str) -> bool {
        let Some((_, location)) = self.locations.remove(&BufferKey::new(tile, column)) else {
            return false;
        };
        self.arena.lock().free_block(location);
        self.metrics.counter(BLOCKS_RELEASED).inc();
        true
    }

    /// Release every staged column of a tile. Returns the number of blocks released.
    pub fn release_tile(&self, tile: TileId) -> usize {
        let columns: Vec<Arc<str>> = self
            .locations
            .iter()
            .filter(|entry| entry.key().tile == tile)
            .map(|entry| entry.key().column.clone())
            .collect();
        columns
            .iter()
            .filter(|column| self.release(tile, column))
            .count()
    }

    pub fn stats(&self) -> ArenaStats {
        let arena = self.arena.lock();
        ArenaStats {
            buffer_count: arena.buffer_count(),
            total_bytes: arena.total_bytes(),
            free_bytes: arena.free_bytes(),
            free_blocks: arena.free_block_count(),
            staged_columns: self.locations.len(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

impl<S: BackingStore> Debug for TileBufferManager<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileBufferManager")
            .field("stats", &self.stats())
            .field("pending", &self.pending.len())
            .field("deferred", &self.deferred.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn deferred_jobs_run_in_order() {
        let queue = DeferredQueue::default();
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        for idx in 0..3 {
            let counter = counter.clone();
            let seen = seen.clone();
            queue.push(
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    seen.lock().push(idx);
                }
                .boxed(),
            );
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.run_pending().await, 3);
        assert!(queue.is_empty());
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn keys_compare_by_tile_and_column() {
        let a = BufferKey::new(TileId::new(1), "x");
        assert_eq!(a, BufferKey::new(TileId::new(1), "x"));
        assert_ne!(a, BufferKey::new(TileId::new(2), "x"));
        assert_ne!(a, BufferKey::new(TileId::new(1), "y"));
    }
}
