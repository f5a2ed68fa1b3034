//! # iSyntax Streamer
//!
//! A decoder and viewport-driven tile streamer for Philips iSyntax whole
//! slide images.
//!
//! iSyntax stores a slide as a wavelet pyramid: every tile carries entropy
//! coded high-pass coefficients, and the low-pass data of a level is the
//! reconstruction of the level above it. This library reads only the bytes a
//! viewport needs and rebuilds tiles from coarse to fine.
//!
//! ## Features
//!
//! - **Streaming header parser**: walks the XML-like header tree in one pass
//!   and resolves codeblock positions through the block header table and
//!   seektable
//! - **Entropy decoder**: canonical Huffman with run-length zero escapes,
//!   both header versions
//! - **Reversible 5/3 wavelet**: tile-by-tile reconstruction with border taps
//!   from neighbors, bit-exact with a whole-image transform
//! - **Frame-driven scheduler**: bounded work per frame, never blocks the
//!   caller, strict readiness checks between tiles and levels
//!
//! ## Architecture
//!
//! - [`io`] - range reads and the chunk cache
//! - [`mod@format`] - container detection and the iSyntax header/codeblock layer
//! - [`codec`] - entropy coding, wavelet transform, color conversion
//! - [`slide`] - the opened-slide handle
//! - [`tile`] - tile state, loader, streamer, worker queue, caches
//! - [`config`] - CLI and runtime tunables
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use isyntax_streamer::{CollectingSink, InlineQueue, IsyntaxSlide, StreamerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let slide = IsyntaxSlide::open_path("slide.isyntax", &StreamerConfig::default()).await?;
//!
//!     let sink = Arc::new(CollectingSink::new());
//!     let streamer = slide.streamer(Arc::new(InlineQueue), sink.clone());
//!     let viewport = slide.viewport(slide.bounds(), 0);
//!     streamer.settle(&viewport, 1000).await;
//!
//!     println!("{} tiles delivered", sink.len());
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod format;
pub mod io;
pub mod slide;
pub mod tile;

// Re-export commonly used types
pub use config::{Cli, Command, StreamerConfig};
pub use error::{
    Base64Error, CodeblockTableError, DecodeError, FormatError, HeaderError, IoError, TileError,
};
pub use format::isyntax::{
    open_container, Bounds, Codeblock, CodeblockStore, DataChunk, ImageHeader, ImageKind,
    ImportMetadata, IsyntaxContainer, IsyntaxHeader, LevelLayout, TileInfo, TileRect,
};
pub use format::{ensure_isyntax, is_isyntax_header};
pub use io::{ChunkCache, LocalFileReader, RangeReader};
pub use slide::{IsyntaxSlide, LevelInfo};
pub use tile::{
    ChannelSink, CollectingSink, CompletedTile, InlineQueue, PassReport, PngTileEncoder, TileCache,
    TileCacheKey, TileLoader, TileOutcome, TileSink, TileStreamer, Viewport, WorkQueue, WorkerPool,
};
