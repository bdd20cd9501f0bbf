//! A progressive quadtree tile dataset engine.
//!
//! A very large point dataset is split into a quadtree of tiles, each an Arrow IPC file holding
//! one [`RecordBatch`][arrow_array::RecordBatch]. A [`Deeptable`] downloads only the tiles a view
//! needs, in priority order, and layers named transformations and boolean selections on top of
//! them. Derived columns are computed per tile, at most once, and only when something asks for
//! them. [`TileBufferManager`] stages columns into bounded device memory.

pub use buffers::*;
pub use composition::*;
pub use deeptable::*;
pub use manifest::*;
pub use options::*;
pub use rect::*;
pub use scheduler::*;
pub use selection::*;
pub use tile::*;
pub use tix::*;
pub use transformation::*;

mod buffers;
pub mod coerce;
mod composition;
mod deeptable;
pub mod ipc;
mod manifest;
pub mod metrics;
mod options;
mod rect;
mod scheduler;
mod selection;
mod table;
mod tile;
mod tix;
mod transformation;

/// The column holding each row's global, monotonically increasing index.
pub const IX_COLUMN: &str = "ix";
