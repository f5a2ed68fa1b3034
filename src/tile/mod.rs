//! Tile runtime: decoding, scheduling and delivery.
//!
//! Everything that happens to a tile after the file is opened lives here.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   Renderer / CLI                        │
//! └──────────┬──────────────────▲───────────┘
//!   service()│ decode_tile()    │ TileSink
//!            ▼                  │
//! ┌─────────────────────────────────────────┐
//! │  TileStreamer          force path       │
//! │  (per-frame passes)    (dependency cone)│
//! └──────────┬──────────────────┬───────────┘
//!            │    WorkQueue     │
//!            ▼                  ▼
//! ┌─────────────────────────────────────────┐
//! │              TileLoader                 │
//! │  ┌───────────┐ ┌──────────┐ ┌────────┐  │
//! │  │ TileState │ │ Block    │ │ Tile   │  │
//! │  │ (flags)   │ │ pools    │ │ cache  │  │
//! │  └───────────┘ └──────────┘ └────────┘  │
//! └────────────────────┬────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │      ChunkCache → RangeReader           │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`TileLoader`]: per-slide tile state, decompression, reconstruction, donation
//! - [`TileStreamer`]: viewport-driven scheduler, one [`TileStreamer::service`] call per frame
//! - [`WorkQueue`]/[`WorkerPool`]: where decode work runs
//! - [`TileSink`]: where finished tiles go
//! - [`TileCache`]: LRU cache of reconstructed BGRA tiles
//! - [`PngTileEncoder`]: PNG export of tiles and associated images
//! - [`BlockAllocator`]: bounded pools for coefficient blocks
//!
//! # Example
//!
//! ```
//! use isyntax_streamer::tile::{TileCache, TileCacheKey};
//! use bytes::Bytes;
//!
//! let cache = TileCache::with_capacity(50 * 1024 * 1024);
//! let key = TileCacheKey::new(2, 0, 1);
//!
//! if cache.get(&key).is_none() {
//!     cache.put(key, Bytes::from(vec![0u8; 4 * 256 * 256]));
//! }
//! assert_eq!(cache.len(), 1);
//! ```

mod allocator;
mod cache;
mod encoder;
mod loader;
mod queue;
mod service;
mod state;
mod streamer;

pub use allocator::{BlockAllocator, CoefficientPools, PooledBlock, DEFAULT_POOL_CHUNK_BLOCKS};
pub use cache::{TileCache, TileCacheKey, DEFAULT_TILE_CACHE_CAPACITY};
pub use encoder::PngTileEncoder;
pub use loader::{Donation, LoadClaim, TileLoader};
pub use queue::{
    ChannelSink, CollectingSink, CompletedTile, InlineQueue, Task, TileSink, WorkQueue, WorkerPool,
};
pub use service::TileOutcome;
pub use state::{
    CoefficientSet, LevelState, TileState, FAILED, HAS_H, HAS_LL, H_CLAIMED, LOADED, LOAD_CLAIMED,
};
pub use streamer::{PassReport, TileStreamer, Viewport};
