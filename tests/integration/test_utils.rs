//! Test utilities for integration tests.
//!
//! This module provides mock range readers and a builder for small synthetic
//! iSyntax files. The builder runs the forward wavelet over a known image, so
//! every reconstructed tile has an exact expected value.

use async_trait::async_trait;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use isyntax_streamer::codec::{
    deinterleave, encode_codeblock, forward_2d, rgb_to_ycocg, ycocg_to_bgra, DEFAULT_COUNTER_BITS,
};
use isyntax_streamer::error::IoError;
use isyntax_streamer::format::isyntax::base64;
use isyntax_streamer::format::isyntax::codeblock::{CodeblockTable, COEFFICIENT_H, COEFFICIENT_LL};
use isyntax_streamer::format::isyntax::container::EOT_MARKER;
use isyntax_streamer::format::isyntax::layout::levels_in_chunk;
use isyntax_streamer::format::isyntax::seektable::encode_seektable;
use isyntax_streamer::io::RangeReader;
use isyntax_streamer::{Codeblock, IsyntaxSlide, StreamerConfig};

// =============================================================================
// Mock Range Reader with Request Tracking
// =============================================================================

/// A mock range reader that tracks all read requests.
///
/// Reads starting inside the failing range, if one is set, return an error.
pub struct TrackingMockReader {
    data: Bytes,
    identifier: String,
    request_count: Arc<AtomicUsize>,
    requests: Arc<RwLock<Vec<(u64, usize)>>>,
    failing: Option<(u64, u64)>,
}

impl TrackingMockReader {
    pub fn new(data: Vec<u8>, identifier: impl Into<String>) -> Self {
        Self {
            data: Bytes::from(data),
            identifier: identifier.into(),
            request_count: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(RwLock::new(Vec::new())),
            failing: None,
        }
    }

    /// Fail every read that starts in `[offset, offset + size)`.
    pub fn with_failing_range(mut self, offset: u64, size: u64) -> Self {
        self.failing = Some((offset, offset + size));
        self
    }

    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::SeqCst)
    }

    pub async fn get_requests(&self) -> Vec<(u64, usize)> {
        self.requests.read().await.clone()
    }

    pub fn reset_tracking(&self) {
        self.request_count.store(0, Ordering::SeqCst);
    }

    /// Number of recorded reads starting at `offset`.
    pub async fn reads_at(&self, offset: u64) -> usize {
        self.requests
            .read()
            .await
            .iter()
            .filter(|(o, _)| *o == offset)
            .count()
    }
}

impl Clone for TrackingMockReader {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            identifier: self.identifier.clone(),
            request_count: Arc::clone(&self.request_count),
            requests: Arc::clone(&self.requests),
            failing: self.failing,
        }
    }
}

#[async_trait]
impl RangeReader for TrackingMockReader {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        self.request_count.fetch_add(1, Ordering::SeqCst);
        self.requests.write().await.push((offset, len));

        if let Some((start, end)) = self.failing {
            if offset >= start && offset < end {
                return Err(IoError::Read(format!("injected failure at offset {}", offset)));
            }
        }

        let start = offset as usize;
        let end = start + len;
        if end > self.data.len() {
            return Err(IoError::RangeOutOfBounds {
                offset,
                requested: len as u64,
                size: self.data.len() as u64,
            });
        }
        Ok(self.data.slice(start..end))
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}

// =============================================================================
// Header Helpers
// =============================================================================

/// A string attribute of the header tree.
pub fn attribute(name: &str, group: u16, element: u16, value: &str) -> String {
    format!(
        "<Attribute Name=\"{}\" Group=\"0x{:04X}\" Element=\"0x{:04X}\" PMSVR=\"IString\">{}</Attribute>\n",
        name, group, element, value
    )
}

/// An array attribute whose items are data objects of `object_type`.
fn array(name: &str, group: u16, element: u16, object_type: &str, items: &[String]) -> String {
    let mut out = format!(
        "<Attribute Name=\"{}\" Group=\"0x{:04X}\" Element=\"0x{:04X}\" PMSVR=\"IDataObjectArray\">\n<Array>\n",
        name, group, element
    );
    for item in items {
        out.push_str(&format!("<DataObject ObjectType=\"{}\">\n{}</DataObject>\n", object_type, item));
    }
    out.push_str("</Array>\n</Attribute>\n");
    out
}

fn dimension_ranges(ranges: &[(i64, i64, i64)]) -> String {
    let items: Vec<String> = ranges
        .iter()
        .map(|(start, step, end)| {
            attribute(
                "UFS_IMAGE_DIMENSION_RANGE",
                0x301D,
                0x200B,
                &format!("{} {} {}", start, step, end),
            )
        })
        .collect();
    array("UFS_IMAGE_DIMENSION_RANGES", 0x301D, 0x200A, "UFSImageDimensionRange", &items)
}

/// Create a test RGB JPEG image.
pub fn create_test_rgb_jpeg(width: u32, height: u32, quality: u8) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        let r = (x % 256) as u8;
        let g = (y % 256) as u8;
        let b = ((x + y) % 256) as u8;
        Rgb([r, g, b])
    });

    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    encoder.encode_image(&img).unwrap();
    buf
}

// =============================================================================
// Synthetic Slide Builder
// =============================================================================

/// Y, Co and Cg planes of one scale.
type Planes = [Vec<i32>; 3];

/// Builder for a synthetic iSyntax file.
///
/// The image is `top_tiles_x × top_tiles_y` tiles at the coarsest scale, so
/// every level has a full tile grid and every chunk is complete.
#[derive(Debug, Clone)]
pub struct SyntheticSlideBuilder {
    block_width: usize,
    block_height: usize,
    levels: u32,
    top_tiles_x: usize,
    top_tiles_y: usize,
    partial: bool,
    compressor_version: u8,
    corrupt: Vec<(u32, usize, usize)>,
    label: bool,
    mpp: f64,
}

impl Default for SyntheticSlideBuilder {
    fn default() -> Self {
        Self {
            block_width: 8,
            block_height: 8,
            levels: 4,
            top_tiles_x: 2,
            top_tiles_y: 1,
            partial: false,
            compressor_version: 2,
            corrupt: Vec::new(),
            label: false,
            mpp: 0.25,
        }
    }
}

impl SyntheticSlideBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_size(mut self, width: usize, height: usize) -> Self {
        self.block_width = width;
        self.block_height = height;
        self
    }

    pub fn levels(mut self, levels: u32) -> Self {
        self.levels = levels;
        self
    }

    pub fn top_tiles(mut self, x: usize, y: usize) -> Self {
        self.top_tiles_x = x;
        self.top_tiles_y = y;
        self
    }

    /// Leave offsets out of the block header table and write a seektable.
    pub fn partial(mut self, partial: bool) -> Self {
        self.partial = partial;
        self
    }

    pub fn compressor_version(mut self, version: u8) -> Self {
        self.compressor_version = version;
        self
    }

    /// Replace the Y high-pass codeblock of a tile with undecodable bytes.
    pub fn corrupt_tile(mut self, scale: u32, x: usize, y: usize) -> Self {
        self.corrupt.push((scale, x, y));
        self
    }

    /// Embed a JPEG label image.
    pub fn with_label(mut self) -> Self {
        self.label = true;
        self
    }

    pub fn build(&self) -> SyntheticSlide {
        let (bw, bh) = (self.block_width, self.block_height);
        let (tw, th) = (2 * bw, 2 * bh);
        let block_len = bw * bh;
        let width = self.top_tiles_x * (bw << self.levels);
        let height = self.top_tiles_y * (bh << self.levels);

        // Forward transform, one scale at a time
        let mut planes: Vec<Planes> = Vec::new();
        let mut h_blocks: Vec<Vec<[Vec<i16>; 3]>> = Vec::new();
        let mut top_ll: Vec<[Vec<i16>; 3]> = Vec::new();
        let mut current = base_image(width, height);
        let (mut w, mut h) = (width, height);
        for scale in 0..self.levels {
            planes.push(current.clone());
            let (tiles_x, tiles_y) = (w / tw, h / th);
            let mut transformed = current.clone();
            for plane in transformed.iter_mut() {
                forward_2d(plane, w, h);
            }

            let mut level_h = Vec::with_capacity(tiles_x * tiles_y);
            let mut level_ll = Vec::with_capacity(tiles_x * tiles_y);
            for ty in 0..tiles_y {
                for tx in 0..tiles_x {
                    let mut hs: [Vec<i16>; 3] = Default::default();
                    let mut lls: [Vec<i16>; 3] = Default::default();
                    for color in 0..3 {
                        let mut ll = vec![0i16; block_len];
                        let mut hb = vec![0i16; 3 * block_len];
                        deinterleave(&transformed[color], w, tx * tw, ty * th, bw, bh, &mut ll, &mut hb);
                        hs[color] = hb;
                        lls[color] = ll;
                    }
                    level_h.push(hs);
                    level_ll.push(lls);
                }
            }
            h_blocks.push(level_h);
            if scale == self.levels - 1 {
                top_ll = level_ll;
            }

            let (nw, nh) = (w / 2, h / 2);
            current = std::array::from_fn(|color| {
                let mut next = vec![0i32; nw * nh];
                for j in 0..nh {
                    for i in 0..nw {
                        next[j * nw + i] = transformed[color][2 * j * w + 2 * i];
                    }
                }
                next
            });
            w = nw;
            h = nh;
        }

        // Codeblocks in chunk order: color-major, coarse to fine, row-major
        let max_scale = self.levels - 1;
        let tiles_at = |scale: u32| (width / (tw << scale), height / (th << scale));
        let mut codeblocks = Vec::new();
        let mut payloads: Vec<Vec<u8>> = Vec::new();
        let mut chunk_bounds: Vec<(usize, usize)> = Vec::new();
        let mut root = i64::from(max_scale);
        while root >= 0 {
            let root_scale = root as u32;
            let depth_count = levels_in_chunk(root_scale);
            let (roots_x, roots_y) = tiles_at(root_scale);
            for ry in 0..roots_y {
                for rx in 0..roots_x {
                    let first = codeblocks.len();
                    for color in 0..3u32 {
                        for depth in 0..depth_count {
                            let scale = root_scale - depth;
                            let side = 1usize << depth;
                            let level_tiles_x = tiles_at(scale).0;
                            for dy in 0..side {
                                for dx in 0..side {
                                    let (tx, ty) = (rx * side + dx, ry * side + dy);
                                    codeblocks.push(Codeblock {
                                        x: (tx * (tw << scale)) as u32,
                                        y: (ty * (th << scale)) as u32,
                                        color,
                                        scale,
                                        coefficient: COEFFICIENT_H,
                                        compressor_version: self.compressor_version,
                                        ..Default::default()
                                    });
                                    let corrupt = color == 0 && self.corrupt.contains(&(scale, tx, ty));
                                    payloads.push(if corrupt {
                                        vec![0xFF]
                                    } else {
                                        encode_codeblock(
                                            &h_blocks[scale as usize][ty * level_tiles_x + tx][color as usize],
                                            3,
                                            self.compressor_version,
                                            bw,
                                            bh,
                                            DEFAULT_COUNTER_BITS,
                                        )
                                    });
                                }
                            }
                        }
                        if root_scale == max_scale {
                            codeblocks.push(Codeblock {
                                x: (rx * (tw << root_scale)) as u32,
                                y: (ry * (th << root_scale)) as u32,
                                color,
                                scale: root_scale,
                                coefficient: COEFFICIENT_LL,
                                compressor_version: self.compressor_version,
                                ..Default::default()
                            });
                            payloads.push(encode_codeblock(
                                &top_ll[ry * roots_x + rx][color as usize],
                                1,
                                self.compressor_version,
                                bw,
                                bh,
                                DEFAULT_COUNTER_BITS,
                            ));
                        }
                    }
                    chunk_bounds.push((first, codeblocks.len()));
                }
            }
            root -= i64::from(depth_count);
        }

        let label_jpeg = self.label.then(|| create_test_rgb_jpeg(48, 24, 90));

        // The table size does not depend on the offsets, so the header
        // length is known before they are assigned.
        let mut table = CodeblockTable {
            partial: self.partial,
            codeblocks,
        };
        let header_len = self.header_xml(&table, width, height, label_jpeg.as_deref()).len();
        let data_offset = header_len as u64 + 1;

        let seektable_entries = |codeblocks: &[Codeblock]| -> Vec<(u64, u64)> {
            let mut entries = Vec::new();
            for (i, cb) in codeblocks.iter().enumerate() {
                if i % 5 == 0 {
                    entries.push((0, 0));
                }
                entries.push((cb.offset, cb.size));
            }
            entries
        };
        let seektable_len = if self.partial {
            encode_seektable(&seektable_entries(&table.codeblocks), None).len() as u64
        } else {
            0
        };

        let mut offset = data_offset + seektable_len;
        for (cb, payload) in table.codeblocks.iter_mut().zip(&payloads) {
            cb.offset = offset;
            cb.size = payload.len() as u64;
            offset += cb.size;
        }
        let chunk_ranges = chunk_bounds
            .iter()
            .map(|&(first, last)| {
                let start = table.codeblocks[first].offset;
                (start, table.codeblocks[last - 1].end() - start)
            })
            .collect();

        let xml = self.header_xml(&table, width, height, label_jpeg.as_deref());
        assert_eq!(xml.len(), header_len);
        let mut data = xml.into_bytes();
        data.push(EOT_MARKER);
        if self.partial {
            data.extend_from_slice(&encode_seektable(&seektable_entries(&table.codeblocks), None));
        }
        for payload in &payloads {
            data.extend_from_slice(payload);
        }

        SyntheticSlide {
            data,
            tile_width: tw,
            tile_height: th,
            levels: self.levels,
            width,
            height,
            planes,
            chunk_ranges,
            codeblock_count: table.codeblocks.len(),
            label_jpeg,
            mpp: self.mpp,
        }
    }

    fn header_xml(&self, table: &CodeblockTable, width: usize, height: usize, label: Option<&[u8]>) -> String {
        // A partial table leaves offsets and sizes out on its own
        let encoded_table = base64::encode(&table.to_bytes());

        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\" ?>\n");
        xml.push_str("<DataObject ObjectType=\"UFSImport\">\n");
        xml.push_str(&attribute("DICOM_MANUFACTURER", 0x0008, 0x0070, "PHILIPS"));
        xml.push_str(&attribute("DICOM_MANUFACTURERS_MODEL_NAME", 0x0008, 0x1090, "Synthetic Scanner"));
        xml.push_str(&attribute("DICOM_DEVICE_SERIAL_NUMBER", 0x0018, 0x1000, "SYN-0001"));
        xml.push_str(&attribute("PIM_DP_UFS_BARCODE", 0x301D, 0x1002, &base64::encode(b"SLIDE-42")));

        let mut wsi = String::new();
        wsi.push_str(&attribute("PIM_DP_IMAGE_TYPE", 0x301D, 0x1004, "WSI"));
        wsi.push_str(&attribute(
            "DICOM_DERIVATION_DESCRIPTION",
            0x0008,
            0x2111,
            &format!(
                "PHILIPS UFS V1.1 | Quality=80 | DWT=1 | Compressor={}",
                self.compressor_version
            ),
        ));
        let general = format!(
            "{}{}",
            dimension_ranges(&[
                (0, 1, width as i64 - 1),
                (0, 1, height as i64 - 1),
                (0, 1, 2),
                (0, 1, i64::from(self.levels) - 1),
            ]),
            array(
                "UFS_IMAGE_DIMENSIONS",
                0x301D,
                0x2003,
                "UFSImageDimension",
                &[
                    attribute("UFS_IMAGE_DIMENSION_SCALE_FACTOR", 0x301D, 0x2007, &self.mpp.to_string()),
                    attribute("UFS_IMAGE_DIMENSION_SCALE_FACTOR", 0x301D, 0x2007, &self.mpp.to_string()),
                ],
            )
        );
        wsi.push_str(&array("UFS_IMAGE_GENERAL_HEADERS", 0x301D, 0x2000, "UFSImageGeneralHeader", &[general]));
        let template = dimension_ranges(&[
            (0, 1, self.block_width as i64 - 1),
            (0, 1, self.block_height as i64 - 1),
        ]);
        wsi.push_str(&array(
            "UFS_IMAGE_BLOCK_HEADER_TEMPLATES",
            0x301D,
            0x2009,
            "UFSImageBlockHeaderTemplate",
            &[template],
        ));
        wsi.push_str(&attribute("UFS_IMAGE_BLOCK_HEADER_TABLE", 0x301D, 0x2014, &encoded_table));

        let mut images = vec![wsi];
        if let Some(jpeg) = label {
            let mut item = attribute("PIM_DP_IMAGE_TYPE", 0x301D, 0x1004, "LABELIMAGE");
            item.push_str(&attribute("PIM_DP_IMAGE_DATA", 0x301D, 0x1005, &base64::encode(jpeg)));
            images.push(item);
        }
        xml.push_str(&array("PIM_DP_SCANNED_IMAGES", 0x301D, 0x1003, "DPScannedImage", &images));
        xml.push_str("</DataObject>\r\n");
        xml
    }
}

/// Deterministic RGB content converted to YCoCg planes.
fn base_image(width: usize, height: usize) -> Planes {
    let mut seed = 0x2545_F491u32;
    let mut planes: Planes = Default::default();
    for plane in planes.iter_mut() {
        plane.reserve(width * height);
    }
    for y in 0..height {
        for x in 0..width {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let noise = (seed % 32) as i32;
            let r = ((x * 3 + y) % 200) as i32 + noise;
            let g = ((x + 2 * y) % 180) as i32 + noise / 2;
            let b = (((x / 4) ^ (y / 4)) % 160) as i32 + 40;
            let (luma, co, cg) = rgb_to_ycocg(r, g, b);
            planes[0].push(luma);
            planes[1].push(co);
            planes[2].push(cg);
        }
    }
    planes
}

// =============================================================================
// Synthetic Slide
// =============================================================================

/// A synthetic iSyntax file plus the image it encodes.
pub struct SyntheticSlide {
    pub data: Vec<u8>,
    pub tile_width: usize,
    pub tile_height: usize,
    pub levels: u32,
    /// Base-level width in pixels
    pub width: usize,
    /// Base-level height in pixels
    pub height: usize,
    planes: Vec<Planes>,
    /// `(offset, size)` of every chunk, in file order
    pub chunk_ranges: Vec<(u64, u64)>,
    pub codeblock_count: usize,
    pub label_jpeg: Option<Vec<u8>>,
    pub mpp: f64,
}

impl SyntheticSlide {
    pub fn reader(&self) -> TrackingMockReader {
        TrackingMockReader::new(self.data.clone(), "mock://synthetic.isyntax")
    }

    /// Tile grid of `scale`.
    pub fn tiles_at(&self, scale: u32) -> (usize, usize) {
        (
            self.width / (self.tile_width << scale),
            self.height / (self.tile_height << scale),
        )
    }

    /// BGRA pixels tile (`tx`, `ty`) of `scale` must reconstruct to.
    pub fn expected_bgra(&self, scale: u32, tx: usize, ty: usize) -> Vec<u8> {
        let planes = &self.planes[scale as usize];
        let plane_width = self.width >> scale;
        let (tw, th) = (self.tile_width, self.tile_height);
        let region = |color: usize| -> Vec<i16> {
            let mut out = Vec::with_capacity(tw * th);
            for y in 0..th {
                let start = (ty * th + y) * plane_width + tx * tw;
                out.extend(planes[color][start..start + tw].iter().map(|&v| v as i16));
            }
            out
        };
        let mut bgra = vec![0u8; 4 * tw * th];
        ycocg_to_bgra(&region(0), &region(1), &region(2), &mut bgra);
        bgra
    }

    /// Size in microns of one tile side at `scale`.
    pub fn tile_side_um(&self, scale: u32) -> f64 {
        (self.tile_width << scale) as f64 * self.mpp
    }
}

/// Configuration with small, test-friendly limits.
pub fn test_config() -> StreamerConfig {
    StreamerConfig {
        workers: 2,
        queue_capacity: 256,
        chunk_cache_chunks: 64,
        tile_cache_bytes: 64 * 1024 * 1024,
        max_chunks_per_pass: 4,
        ..Default::default()
    }
}

/// Open `slide` over a tracking reader.
pub async fn open_synthetic(
    slide: &SyntheticSlide,
    config: &StreamerConfig,
) -> (Arc<IsyntaxSlide>, TrackingMockReader) {
    let reader = slide.reader();
    let opened = IsyntaxSlide::open(Arc::new(reader.clone()), config)
        .await
        .expect("synthetic slide should open");
    (opened, reader)
}
