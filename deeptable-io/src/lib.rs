//! Transports for fetching tile bytes.
//!
//! Every byte a Deeptable reads goes through a [`TileProxy`]. The proxy receives a fully
//! described [`ApiRequest`] and returns the response body, which lets consumers plug in
//! authenticated or non-HTTP transports, or serve tiles straight from memory.

pub use memory::*;
#[cfg(feature = "object_store")]
pub use object_store::*;
pub use proxy::*;

mod memory;
#[cfg(feature = "object_store")]
mod object_store;
mod proxy;
