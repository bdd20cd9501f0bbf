//! The bounded download queue and the periodic task that drains it.

use std::collections::{HashSet, VecDeque};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use deeptable_error::{DeeptableResult, deeptable_err};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::{Tile, Tix};

/// The default number of downloads queued or in flight at once.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 16;

#[derive(Default)]
struct QueueState {
    queued: VecDeque<Arc<Tile>>,
    in_flight: HashSet<Tix>,
}

/// Holds at most `capacity` tiles that are either waiting for the next flush or being fetched.
///
/// Callers offer scored candidates; the best ones take the free slots. A flush spawns every
/// queued download on the current tokio runtime, and a finished download (successful or not)
/// frees its slot.
pub struct DownloadQueue {
    capacity: usize,
    state: Mutex<QueueState>,
}

impl DownloadQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Default::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queued.len()
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Whether the tile is waiting in the queue or being fetched.
    pub fn is_pending(&self, tix: Tix) -> bool {
        let state = self.state.lock();
        state.in_flight.contains(&tix) || state.queued.iter().any(|tile| tile.tix() == tix)
    }

    /// Queue the highest scoring candidates that fit. Candidates scoring zero or less, and
    /// tiles already pending, are skipped. Returns the number of tiles queued.
    pub fn offer(&self, mut candidates: Vec<(f64, Arc<Tile>)>) -> usize {
        candidates.retain(|(score, _)| *score > 0.0);
        candidates.sort_by(|(a, _), (b, _)| b.total_cmp(a));

        let mut state = self.state.lock();
        let mut added = 0;
        for (score, tile) in candidates {
            if state.queued.len() + state.in_flight.len() >= self.capacity {
                break;
            }
            let tix = tile.tix();
            if state.in_flight.contains(&tix) || state.queued.iter().any(|t| t.tix() == tix) {
                continue;
            }
            log::trace!("Queueing tile {} with score {:.3}", tile.key(), score);
            state.queued.push_back(tile);
            added += 1;
        }
        added
    }

    /// Launch every queued download. Returns the number launched.
    ///
    /// Must be called from within a tokio runtime.
    pub fn flush(self: &Arc<Self>) -> DeeptableResult<usize> {
        let handle = Handle::try_current()
            .map_err(|e| deeptable_err!("flushing downloads requires a tokio runtime: {}", e))?;
        let launched: Vec<Arc<Tile>> = {
            let mut state = self.state.lock();
            let launched: Vec<_> = state.queued.drain(..).collect();
            state.in_flight.extend(launched.iter().map(|tile| tile.tix()));
            launched
        };

        for tile in &launched {
            let queue = self.clone();
            let tile = tile.clone();
            handle.spawn(async move {
                if let Err(err) = tile.download().await {
                    log::warn!("Download of tile {} failed: {}", tile.key(), err);
                }
                queue.state.lock().in_flight.remove(&tile.tix());
            });
        }
        if !launched.is_empty() {
            log::debug!("Launched {} tile downloads", launched.len());
        }
        Ok(launched.len())
    }
}

impl Debug for DownloadQueue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DownloadQueue")
            .field("capacity", &self.capacity)
            .field("queued", &state.queued.len())
            .field("in_flight", &state.in_flight.len())
            .finish()
    }
}

/// A background task that stops when the handle is dropped.
#[derive(Debug)]
pub struct SchedulerHandle {
    handle: JoinHandle<()>,
}

impl SchedulerHandle {
    pub(crate) fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }

    /// Whether the task has exited, which happens once the owning table is dropped.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the task. Downloads it already launched run to completion.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
