//! The opened-slide handle.
//!
//! [`IsyntaxSlide`] ties together everything built at open time (header
//! metadata, codeblock store) and the runtime tile state. It is the one
//! object tools and renderers hold on to.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::info;

use crate::config::StreamerConfig;
use crate::error::{FormatError, TileError};
use crate::format::isyntax::layout::Bounds;
use crate::format::isyntax::{open_container, ImageHeader, ImageKind, ImportMetadata, IsyntaxHeader};
use crate::io::{LocalFileReader, RangeReader};
use crate::tile::{PngTileEncoder, TileLoader, TileOutcome, TileSink, TileStreamer, Viewport, WorkQueue};

// =============================================================================
// Level Information
// =============================================================================

/// Information about a single pyramid level.
///
/// This struct provides a snapshot of level metadata that can be queried
/// without async operations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LevelInfo {
    /// Wavelet scale (0 = full resolution)
    pub scale: u32,

    /// Width of this level in pixels
    pub width: u64,

    /// Height of this level in pixels
    pub height: u64,

    /// Width of each tile in pixels
    pub tile_width: u32,

    /// Height of each tile in pixels
    pub tile_height: u32,

    /// Number of tiles in X direction
    pub tiles_x: u32,

    /// Number of tiles in Y direction
    pub tiles_y: u32,

    /// Tiles with codeblocks in the file
    pub existing_tiles: u32,

    /// Downsample factor relative to level 0
    pub downsample: f64,

    /// Microns per pixel at this level
    pub mpp_x: f64,
    pub mpp_y: f64,
}

// =============================================================================
// iSyntax Slide
// =============================================================================

/// An opened iSyntax file.
///
/// # Example
///
/// ```no_run
/// use isyntax_streamer::config::StreamerConfig;
/// use isyntax_streamer::slide::IsyntaxSlide;
/// use isyntax_streamer::tile::TileOutcome;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let slide = IsyntaxSlide::open_path("slide.isyntax", &StreamerConfig::default()).await?;
/// if let TileOutcome::Pixels(tile) = slide.decode_tile(0, 3, 5).await? {
///     println!("{}x{} BGRA tile", tile.width, tile.height);
/// }
/// # Ok(())
/// # }
/// ```
pub struct IsyntaxSlide {
    identifier: String,
    header: IsyntaxHeader,
    header_length: u64,
    data_offset: u64,
    wsi_index: usize,
    loader: Arc<TileLoader>,
    config: StreamerConfig,
}

impl IsyntaxSlide {
    /// Open a local file.
    pub async fn open_path(path: impl AsRef<Path>, config: &StreamerConfig) -> Result<Arc<Self>, FormatError> {
        let reader = LocalFileReader::open(path).await?;
        Self::open(Arc::new(reader), config).await
    }

    /// Open a slide over any range reader.
    ///
    /// Parses the header, resolves every codeblock and decodes the levels
    /// stored in the top chunks.
    pub async fn open(reader: Arc<dyn RangeReader>, config: &StreamerConfig) -> Result<Arc<Self>, FormatError> {
        let start = Instant::now();
        let container = open_container(reader.as_ref()).await?;
        let store = &container.store;
        info!(
            "Opened {}: {}x{} px, {} levels, {} codeblocks in {} chunks, header {} bytes ({:.1?})",
            reader.identifier(),
            store.width,
            store.height,
            store.level_count(),
            store.codeblocks.len(),
            store.chunks.len(),
            container.header_length,
            start.elapsed()
        );

        let identifier = reader.identifier().to_string();
        let loader = TileLoader::new(container.store, reader, config);
        loader.first_load().await;

        Ok(Arc::new(Self {
            identifier,
            header: container.header,
            header_length: container.header_length,
            data_offset: container.data_offset,
            wsi_index: container.wsi_index,
            loader,
            config: config.clone(),
        }))
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn header(&self) -> &IsyntaxHeader {
        &self.header
    }

    /// Scanner metadata.
    pub fn import(&self) -> &ImportMetadata {
        &self.header.import
    }

    /// Header of the whole-slide image.
    pub fn wsi_image(&self) -> Option<&ImageHeader> {
        self.header.images.get(self.wsi_index)
    }

    /// Length of the header text, EOT marker excluded.
    pub fn header_length(&self) -> u64 {
        self.header_length
    }

    /// File offset just past the EOT marker.
    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    pub fn loader(&self) -> &Arc<TileLoader> {
        &self.loader
    }

    pub fn level_count(&self) -> usize {
        self.loader.store().level_count()
    }

    /// Base-level size in pixels.
    pub fn dimensions(&self) -> (u64, u64) {
        let store = self.loader.store();
        (store.width, store.height)
    }

    pub fn tile_size(&self) -> (u32, u32) {
        let store = self.loader.store();
        (store.tile_width, store.tile_height)
    }

    pub fn level_info(&self, scale: u32) -> Option<LevelInfo> {
        let store = self.loader.store();
        let layout = store.level(scale)?;
        let downsample = f64::from(1u32 << scale);
        Some(LevelInfo {
            scale,
            width: store.width.div_ceil(1 << scale),
            height: store.height.div_ceil(1 << scale),
            tile_width: store.tile_width,
            tile_height: store.tile_height,
            tiles_x: layout.width_in_tiles,
            tiles_y: layout.height_in_tiles,
            existing_tiles: layout.existing_tiles,
            downsample,
            mpp_x: store.mpp_x * downsample,
            mpp_y: store.mpp_y * downsample,
        })
    }

    /// All levels, finest first.
    pub fn levels(&self) -> Vec<LevelInfo> {
        (0..self.level_count() as u32).filter_map(|s| self.level_info(s)).collect()
    }

    /// Whole image in microns.
    pub fn bounds(&self) -> Bounds {
        let store = self.loader.store();
        Bounds::new(
            0.0,
            0.0,
            store.width as f64 * store.mpp_x,
            store.height as f64 * store.mpp_y,
        )
    }

    /// Raw JPEG bytes of the label or macro image.
    pub fn associated_image(&self, kind: ImageKind) -> Option<&[u8]> {
        self.header.image(kind)?.image_data.as_deref()
    }

    /// The label or macro image re-encoded as PNG.
    ///
    /// Returns `Ok(None)` if the file carries no such image.
    pub fn associated_png(&self, kind: ImageKind) -> Result<Option<Bytes>, TileError> {
        self.associated_image(kind)
            .map(|jpeg| PngTileEncoder::new().jpeg_to_png(jpeg))
            .transpose()
    }

    /// Decode one tile, loading whatever it depends on.
    pub async fn decode_tile(&self, level: u32, x: u32, y: u32) -> Result<TileOutcome, TileError> {
        self.loader.decode_tile(level, x, y).await
    }

    /// Create a streamer delivering into `sink`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn streamer(&self, queue: Arc<dyn WorkQueue>, sink: Arc<dyn TileSink>) -> TileStreamer {
        TileStreamer::new(Arc::clone(&self.loader), queue, sink, Handle::current(), &self.config)
    }

    /// Viewport showing `bounds` down to `scale`.
    pub fn viewport(&self, bounds: Bounds, scale: u32) -> Viewport {
        Viewport::new(bounds, scale.min(self.loader.store().max_scale()))
    }
}

impl std::fmt::Debug for IsyntaxSlide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsyntaxSlide")
            .field("identifier", &self.identifier)
            .field("levels", &self.level_count())
            .field("dimensions", &self.dimensions())
            .finish()
    }
}
