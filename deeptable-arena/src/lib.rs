#![deny(missing_docs)]

//! A buffer arena stages many small, per-tile column buffers into a handful of large, fixed-size
//! backing buffers.
//!
//! Device memory (for example GPU buffers) is expensive to allocate and bounded in size, so the
//! arena preallocates large backing buffers and hands out byte ranges ([`BufferLocation`]s) from
//! them. Released ranges are kept on a free list keyed by their exact byte size and reused for
//! later requests of the same size. Ranges are never split or coalesced.
//!
//! The arena is generic over a [`BackingStore`], which creates the backing buffers and performs
//! the (possibly asynchronous) upload of bytes into a location. [`HostStore`] is a store backed
//! by host memory.

pub use arena::*;
pub use host::*;
pub use location::*;
pub use store::*;

mod arena;
mod host;
mod location;
mod store;

/// The default size of each backing buffer, 64 MiB.
pub const DEFAULT_BUFFER_SIZE: usize = 64 << 20;

/// The alignment of every block handed out by bump allocation.
pub const BLOCK_ALIGNMENT: usize = 8;
