//! Pixel export.
//!
//! Reconstructed tiles are BGRA; exported files are RGBA PNG. Associated
//! images (label, macro) are stored in the header as JPEG and decoded here.
//!
//! # Design Decisions
//!
//! - **Lossless output**: tiles are written as PNG so an exported tile is
//!   bit-exact with what the streamer delivers.
//!
//! - **No resizing**: tiles are exported at their native size.

use std::io::Cursor;

use bytes::Bytes;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, ImageReader, RgbaImage};

use crate::codec::bgra_to_rgba;
use crate::error::TileError;

// =============================================================================
// PNG Encoder
// =============================================================================

/// Encoder turning BGRA tiles into PNG files.
#[derive(Debug, Clone, Default)]
pub struct PngTileEncoder;

impl PngTileEncoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a `width × height` BGRA buffer as PNG.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer size does not match the dimensions or
    /// encoding fails.
    pub fn encode_bgra(&self, bgra: &[u8], width: u32, height: u32) -> Result<Bytes, TileError> {
        let expected = width as usize * height as usize * 4;
        if bgra.len() != expected {
            return Err(TileError::Encode(format!(
                "buffer holds {} bytes, {}x{} BGRA needs {}",
                bgra.len(),
                width,
                height,
                expected
            )));
        }
        let mut rgba = bgra.to_vec();
        bgra_to_rgba(&mut rgba);
        self.encode_rgba(&rgba, width, height)
    }

    /// Encode a `width × height` RGBA buffer as PNG.
    pub fn encode_rgba(&self, rgba: &[u8], width: u32, height: u32) -> Result<Bytes, TileError> {
        let mut output = Vec::new();
        PngEncoder::new(&mut output)
            .write_image(rgba, width, height, ExtendedColorType::Rgba8)
            .map_err(|e| TileError::Encode(e.to_string()))?;
        Ok(Bytes::from(output))
    }

    /// Decode an embedded JPEG (label or macro image) to RGBA.
    pub fn decode_jpeg(&self, source: &[u8]) -> Result<RgbaImage, TileError> {
        let reader = ImageReader::with_format(Cursor::new(source), image::ImageFormat::Jpeg);
        let img = reader
            .decode()
            .map_err(|e| TileError::Encode(format!("cannot decode embedded JPEG: {}", e)))?;
        Ok(img.to_rgba8())
    }

    /// Re-encode an embedded JPEG as PNG.
    pub fn jpeg_to_png(&self, source: &[u8]) -> Result<Bytes, TileError> {
        let img = self.decode_jpeg(source)?;
        self.encode_rgba(img.as_raw(), img.width(), img.height())
    }
}

// =============================================================================
// Tests
// =============================================================================
