use std::sync::Arc;

use witchcraft_metrics::{Counter, MetricId, MetricRegistry};
pub use witchcraft_metrics::Metric;

pub const TILES_REQUESTED: &str = "deeptable.tiles.requested";
pub const TILES_COMPLETED: &str = "deeptable.tiles.completed";
pub const TILES_FAILED: &str = "deeptable.tiles.failed";
pub const SIDECARS_FETCHED: &str = "deeptable.sidecars.fetched";
pub const TRANSFORMATIONS_EVALUATED: &str = "deeptable.transformations.evaluated";
pub const TRANSFORMATIONS_FAILED: &str = "deeptable.transformations.failed";
pub const BLOCKS_ALLOCATED: &str = "deeptable.buffers.blocks.allocated";
pub const BLOCKS_RELEASED: &str = "deeptable.buffers.blocks.released";

/// The metric registry of one Deeptable and the buffer managers attached to it.
///
/// Cloning is cheap and clones share counters.
#[derive(Clone, Default)]
pub struct DeeptableMetrics {
    registry: Arc<MetricRegistry>,
}

impl DeeptableMetrics {
    /// Returns the counter with the specified ID, creating it if absent.
    ///
    /// # Panics
    ///
    /// Panics if a metric is registered with the ID that is not a counter.
    pub fn counter<T>(&self, id: T) -> Arc<Counter>
    where
        T: Into<MetricId>,
    {
        self.registry.counter(id)
    }

    /// The current value of a counter, zero if it was never touched.
    pub fn count(&self, id: &str) -> i64 {
        self.registry
            .metrics()
            .iter()
            .find_map(|(metric_id, metric)| match metric {
                Metric::Counter(counter) if metric_id.name() == id => Some(counter.count()),
                _ => None,
            })
            .unwrap_or(0)
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }
}
