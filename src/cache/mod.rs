//! In-process tile cache.
//!
//! A bounded LRU of encoded tile bytes plus a parallel fetcher against the
//! object store's public URL, shared process-wide. First-touch latency of
//! remote reads drops to microseconds on repeat access, and the batch tile
//! endpoint fans out through the fetch pool.

mod tile_cache;

pub use tile_cache::{CacheStats, TileCache, TileKey};
