//! Codeblock store: level geometry, tile grid and data chunks.
//!
//! The block header table lists codeblocks chunk by chunk. A chunk is rooted
//! at one tile of a "chunk scale" (the coarsest scale, then every third scale
//! below it) and holds, per color, that tile's H block followed by the H
//! blocks of its descendants on the next one or two finer scales:
//!
//! ```text
//! per color:  [ H(S) | 4 × H(S-1) | 16 × H(S-2) | LL(S) ]
//!               ^0     ^1..=4       ^5..=20       ^last, coarsest chunks only
//!
//! chunk:      [ color 0 | color 1 | color 2 ]
//! ```
//!
//! Within a group of descendants, blocks are ordered row-major. The store is
//! built once at open time and is immutable afterwards.

use serde::Serialize;
use tracing::{debug, warn};

use super::codeblock::{Codeblock, COEFFICIENT_H, COEFFICIENT_LL};
use super::metadata::ImageHeader;
use crate::error::FormatError;

/// Codeblock side used when the header carries no block template.
pub const DEFAULT_BLOCK_SIZE: u32 = 128;

/// Microns per pixel assumed when the header carries no scale factor.
pub const DEFAULT_MPP: f64 = 0.25;

/// Number of color channels (Y, Co, Cg).
pub const COLOR_COUNT: usize = 3;

// =============================================================================
// Adjacency Mask
// =============================================================================

pub const ADJ_TOP_LEFT: u16 = 1 << 0;
pub const ADJ_TOP_CENTER: u16 = 1 << 1;
pub const ADJ_TOP_RIGHT: u16 = 1 << 2;
pub const ADJ_CENTER_LEFT: u16 = 1 << 3;
pub const ADJ_CENTER: u16 = 1 << 4;
pub const ADJ_CENTER_RIGHT: u16 = 1 << 5;
pub const ADJ_BOTTOM_LEFT: u16 = 1 << 6;
pub const ADJ_BOTTOM_CENTER: u16 = 1 << 7;
pub const ADJ_BOTTOM_RIGHT: u16 = 1 << 8;

/// Bit for the neighbor at offset (`dx`, `dy`), both in `-1..=1`.
#[inline]
pub fn adjacency_bit(dx: i32, dy: i32) -> u16 {
    1 << ((dy + 1) * 3 + (dx + 1))
}

// =============================================================================
// Bounds and Tile Rectangles
// =============================================================================

/// An axis-aligned region in microns, relative to the image origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }
}

/// A rectangle of tiles, `max` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TileRect {
    pub min_x: i32,
    pub min_y: i32,
    pub max_x: i32,
    pub max_y: i32,
}

impl TileRect {
    pub fn new(min_x: i32, min_y: i32, max_x: i32, max_y: i32) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.max_x <= self.min_x || self.max_y <= self.min_y
    }

    pub fn width(&self) -> i32 {
        (self.max_x - self.min_x).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.max_y - self.min_y).max(0)
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.min_x && x < self.max_x && y >= self.min_y && y < self.max_y
    }

    /// Intersection with `other`.
    pub fn clip(&self, other: &TileRect) -> TileRect {
        TileRect {
            min_x: self.min_x.max(other.min_x),
            min_y: self.min_y.max(other.min_y),
            max_x: self.max_x.min(other.max_x),
            max_y: self.max_y.min(other.max_y),
        }
    }

    /// Grow by `ring` tiles on every side.
    pub fn expand(&self, ring: i32) -> TileRect {
        TileRect {
            min_x: self.min_x - ring,
            min_y: self.min_y - ring,
            max_x: self.max_x + ring,
            max_y: self.max_y + ring,
        }
    }

    /// Tile coordinates in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        (self.min_y..self.max_y).flat_map(move |y| (self.min_x..self.max_x).map(move |x| (x, y)))
    }
}

// =============================================================================
// Store Types
// =============================================================================

/// Static description of one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TileInfo {
    /// Whether the file stores codeblocks for this tile
    pub exists: bool,
    /// Index of the chunk holding this tile's codeblocks
    pub chunk: u32,
    /// H codeblock index per color
    pub h_codeblocks: [u32; COLOR_COUNT],
    /// LL codeblock index per color (coarsest scale only)
    pub ll_codeblocks: Option<[u32; COLOR_COUNT]>,
}

/// One pyramid level.
#[derive(Debug, Clone)]
pub struct LevelLayout {
    /// Wavelet scale (0 = full resolution)
    pub scale: u32,
    pub width_in_tiles: u32,
    pub height_in_tiles: u32,
    /// Physical tile width in microns
    pub tile_side_um_x: f64,
    /// Physical tile height in microns
    pub tile_side_um_y: f64,
    /// Row-major tile array
    pub tiles: Vec<TileInfo>,
    /// Number of tiles with `exists` set
    pub existing_tiles: u32,
}

impl LevelLayout {
    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    pub fn in_bounds(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && (x as u32) < self.width_in_tiles && (y as u32) < self.height_in_tiles
    }

    /// Row-major index of tile (`x`, `y`), which must be in bounds.
    #[inline]
    pub fn index(&self, x: i32, y: i32) -> usize {
        y as usize * self.width_in_tiles as usize + x as usize
    }

    pub fn tile(&self, x: i32, y: i32) -> Option<&TileInfo> {
        if self.in_bounds(x, y) {
            self.tiles.get(self.index(x, y))
        } else {
            None
        }
    }

    pub fn exists(&self, x: i32, y: i32) -> bool {
        self.tile(x, y).map(|t| t.exists).unwrap_or(false)
    }

    /// Every tile of the level.
    pub fn bounds(&self) -> TileRect {
        TileRect::new(0, 0, self.width_in_tiles as i32, self.height_in_tiles as i32)
    }

    /// Mask of the existing tiles in the 3×3 neighborhood of (`x`, `y`),
    /// the tile itself included.
    pub fn adjacency_mask(&self, x: i32, y: i32) -> u16 {
        let mut mask = 0;
        for dy in -1..=1 {
            for dx in -1..=1 {
                if self.exists(x + dx, y + dy) {
                    mask |= adjacency_bit(dx, dy);
                }
            }
        }
        mask
    }

    /// Tiles intersecting `bounds` (microns), not clipped to the level.
    pub fn tiles_in_bounds(&self, bounds: &Bounds) -> TileRect {
        TileRect {
            min_x: (bounds.min_x / self.tile_side_um_x).floor() as i32,
            min_y: (bounds.min_y / self.tile_side_um_y).floor() as i32,
            max_x: (bounds.max_x / self.tile_side_um_x).ceil() as i32,
            max_y: (bounds.max_y / self.tile_side_um_y).ceil() as i32,
        }
    }
}

/// A contiguous on-disk region read as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataChunk {
    /// Absolute file offset
    pub offset: u64,
    /// Size in bytes
    pub size: u64,
    /// Scale of the chunk's root tile
    pub top_scale: u32,
    /// Number of scales covered (1 to 3)
    pub levels: u32,
    /// Index of the first codeblock of the chunk
    pub first_codeblock: u32,
    /// Codeblocks per color
    pub codeblocks_per_color: u32,
}

impl DataChunk {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub fn codeblock_count(&self) -> u32 {
        self.codeblocks_per_color * COLOR_COUNT as u32
    }

    /// Whether `codeblock`'s bytes lie inside this chunk.
    pub fn covers(&self, codeblock: &Codeblock) -> bool {
        codeblock.offset >= self.offset && codeblock.end() <= self.end()
    }

    /// Slice `codeblock`'s bytes out of this chunk's buffer.
    pub fn codeblock_bytes<'a>(&self, data: &'a [u8], codeblock: &Codeblock) -> Option<&'a [u8]> {
        if !self.covers(codeblock) {
            return None;
        }
        let start = (codeblock.offset - self.offset) as usize;
        data.get(start..start + codeblock.size as usize)
    }
}

/// Number of scales stored in a chunk rooted at `scale`.
pub fn levels_in_chunk(scale: u32) -> u32 {
    scale % 3 + 1
}

/// Codeblocks per color in a chunk rooted at `scale`.
pub fn codeblocks_per_color(scale: u32, max_scale: u32) -> u32 {
    let h_blocks: u32 = (0..levels_in_chunk(scale)).map(|k| 1u32 << (2 * k)).sum();
    h_blocks + u32::from(scale == max_scale)
}

/// Index of a tile's H block within its chunk's color group.
///
/// `depth` is the number of scales below the chunk root, (`dx`, `dy`) the
/// tile's offset from the root's top-left descendant at that depth.
pub fn index_in_chunk(depth: u32, dx: u32, dy: u32) -> u32 {
    let base: u32 = (0..depth).map(|k| 1u32 << (2 * k)).sum();
    base + dy * (1 << depth) + dx
}

// =============================================================================
// Codeblock Store
// =============================================================================

/// Resolved, queryable index of one WSI image.
#[derive(Debug, Clone)]
pub struct CodeblockStore {
    pub block_width: u32,
    pub block_height: u32,
    /// Pixel width of a reconstructed tile (twice the block width)
    pub tile_width: u32,
    pub tile_height: u32,
    /// Base-level coordinate of the image origin
    pub offset_x: i64,
    pub offset_y: i64,
    /// Base-level image size in pixels
    pub width: u64,
    pub height: u64,
    pub mpp_x: f64,
    pub mpp_y: f64,
    /// Levels indexed by scale (0 = finest)
    pub levels: Vec<LevelLayout>,
    pub codeblocks: Vec<Codeblock>,
    pub chunks: Vec<DataChunk>,
}

impl CodeblockStore {
    /// Build the store from the WSI image header and its resolved codeblocks.
    pub fn build(image: &ImageHeader, codeblocks: Vec<Codeblock>) -> Result<Self, FormatError> {
        if codeblocks.is_empty() {
            return Err(FormatError::InvalidGeometry("no codeblocks".to_string()));
        }

        let (block_width, block_height) = block_size(image);
        let tile_width = block_width * 2;
        let tile_height = block_height * 2;

        let max_codeblock_scale = codeblocks.iter().map(|cb| cb.scale).max().unwrap_or(0);
        let level_count = match image.dimension_ranges.get(3) {
            Some(range) if range.step_count() > 0 => range.step_count() as u32,
            _ => max_codeblock_scale + 1,
        };
        if max_codeblock_scale >= level_count {
            return Err(FormatError::InvalidGeometry(format!(
                "codeblock scale {} exceeds level count {}",
                max_codeblock_scale, level_count
            )));
        }
        if level_count > 16 {
            return Err(FormatError::InvalidGeometry(format!(
                "unsupported level count {}",
                level_count
            )));
        }
        let max_scale = level_count - 1;

        let (offset_x, offset_y, width, height) =
            image_extent(image, &codeblocks, tile_width, tile_height)?;

        let mpp_x = image.dimension_scale_factors.first().copied().unwrap_or_else(|| {
            debug!("layout: no scale factor, assuming {} mpp", DEFAULT_MPP);
            DEFAULT_MPP
        });
        let mpp_y = image.dimension_scale_factors.get(1).copied().unwrap_or(mpp_x);

        let grid_width = grid_size(width, block_width, level_count);
        let grid_height = grid_size(height, block_height, level_count);

        let mut levels: Vec<LevelLayout> = (0..level_count)
            .map(|scale| {
                let width_in_tiles = (grid_width >> scale).max(1);
                let height_in_tiles = (grid_height >> scale).max(1);
                LevelLayout {
                    scale,
                    width_in_tiles,
                    height_in_tiles,
                    tile_side_um_x: f64::from(tile_width << scale) * mpp_x,
                    tile_side_um_y: f64::from(tile_height << scale) * mpp_y,
                    tiles: vec![TileInfo::default(); (width_in_tiles * height_in_tiles) as usize],
                    existing_tiles: 0,
                }
            })
            .collect();

        let chunks = group_chunks(&codeblocks, max_scale)?;

        // Color coverage per tile, to reject tiles missing a channel
        let mut colors: Vec<Vec<u8>> = levels.iter().map(|l| vec![0u8; l.tiles.len()]).collect();

        for (chunk_index, chunk) in chunks.iter().enumerate() {
            let first = chunk.first_codeblock as usize;
            let last = first + chunk.codeblock_count() as usize;
            for (index, cb) in codeblocks[first..last].iter().enumerate() {
                let index = (first + index) as u32;
                let level = &mut levels[cb.scale as usize];
                let tx = (cb.x as i64 - offset_x).div_euclid(i64::from(tile_width << cb.scale));
                let ty = (cb.y as i64 - offset_y).div_euclid(i64::from(tile_height << cb.scale));
                if tx < 0
                    || ty < 0
                    || tx >= i64::from(level.width_in_tiles)
                    || ty >= i64::from(level.height_in_tiles)
                {
                    warn!(
                        "layout: codeblock {} at ({}, {}) scale {} lies outside the tile grid",
                        index, cb.x, cb.y, cb.scale
                    );
                    continue;
                }
                let color = cb.color as usize;
                if color >= COLOR_COUNT {
                    return Err(FormatError::InvalidGeometry(format!(
                        "codeblock {} has color {}",
                        index, cb.color
                    )));
                }
                let tile_index = level.index(tx as i32, ty as i32);
                let tile = &mut level.tiles[tile_index];
                tile.chunk = chunk_index as u32;
                if cb.coefficient == COEFFICIENT_LL {
                    tile.ll_codeblocks.get_or_insert([0; COLOR_COUNT])[color] = index;
                } else {
                    tile.h_codeblocks[color] = index;
                    colors[cb.scale as usize][tile_index] |= 1 << color;
                }
            }
        }

        for (level, colors) in levels.iter_mut().zip(&colors) {
            for (tile, &mask) in level.tiles.iter_mut().zip(colors) {
                match mask {
                    0 => {}
                    0b111 => {
                        tile.exists = true;
                        level.existing_tiles += 1;
                    }
                    _ => {
                        return Err(FormatError::InvalidGeometry(format!(
                            "tile in level {} has an incomplete set of color channels",
                            level.scale
                        )));
                    }
                }
            }
        }

        if levels[max_scale as usize]
            .tiles
            .iter()
            .any(|t| t.exists && t.ll_codeblocks.is_none())
        {
            return Err(FormatError::InvalidGeometry(
                "coarsest level tile without LL codeblocks".to_string(),
            ));
        }

        Ok(Self {
            block_width,
            block_height,
            tile_width,
            tile_height,
            offset_x,
            offset_y,
            width,
            height,
            mpp_x,
            mpp_y,
            levels,
            codeblocks,
            chunks,
        })
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn max_scale(&self) -> u32 {
        (self.levels.len() - 1) as u32
    }

    pub fn level(&self, scale: u32) -> Option<&LevelLayout> {
        self.levels.get(scale as usize)
    }

    pub fn tile(&self, scale: u32, x: i32, y: i32) -> Option<&TileInfo> {
        self.level(scale)?.tile(x, y)
    }

    pub fn chunk(&self, index: u32) -> Option<&DataChunk> {
        self.chunks.get(index as usize)
    }

    pub fn codeblock(&self, index: u32) -> Option<&Codeblock> {
        self.codeblocks.get(index as usize)
    }

    /// Number of samples in one coefficient block.
    pub fn block_len(&self) -> usize {
        (self.block_width * self.block_height) as usize
    }
}

fn block_size(image: &ImageHeader) -> (u32, u32) {
    let template = image.block_templates.first();
    let side = |i: usize| {
        template
            .and_then(|t| t.dimension_ranges.get(i))
            .map(|r| r.range())
            .filter(|&r| r > 0 && r <= 4096)
            .map(|r| r as u32)
    };
    match (side(0), side(1)) {
        (Some(w), Some(h)) => (w, h),
        _ => {
            debug!("layout: no block template, assuming {} pixel blocks", DEFAULT_BLOCK_SIZE);
            (DEFAULT_BLOCK_SIZE, DEFAULT_BLOCK_SIZE)
        }
    }
}

/// Origin and size of the base level.
///
/// Taken from the general-header x and y ranges; without them the extent of
/// the codeblocks is used.
fn image_extent(
    image: &ImageHeader,
    codeblocks: &[Codeblock],
    tile_width: u32,
    tile_height: u32,
) -> Result<(i64, i64, u64, u64), FormatError> {
    if let (Some(x), Some(y)) = (image.dimension_ranges.first(), image.dimension_ranges.get(1)) {
        if x.range() > 0 && y.range() > 0 {
            return Ok((x.start, y.start, x.range() as u64, y.range() as u64));
        }
        warn!("layout: empty image dimension ranges, deriving extent from codeblocks");
    }

    let min_x = codeblocks.iter().map(|cb| i64::from(cb.x)).min().unwrap_or(0);
    let min_y = codeblocks.iter().map(|cb| i64::from(cb.y)).min().unwrap_or(0);
    let max_x = codeblocks
        .iter()
        .map(|cb| i64::from(cb.x) + i64::from(tile_width << cb.scale))
        .max()
        .unwrap_or(0);
    let max_y = codeblocks
        .iter()
        .map(|cb| i64::from(cb.y) + i64::from(tile_height << cb.scale))
        .max()
        .unwrap_or(0);
    if max_x <= min_x || max_y <= min_y {
        return Err(FormatError::InvalidGeometry("empty image extent".to_string()));
    }
    Ok((min_x, min_y, (max_x - min_x) as u64, (max_y - min_y) as u64))
}

/// Number of finest-level tiles along one axis.
fn grid_size(extent: u64, block_side: u32, level_count: u32) -> u32 {
    let span = u64::from(block_side) << level_count;
    let top = extent.div_ceil(span).max(1);
    (top << (level_count - 1)) as u32
}

/// Split the codeblock list into chunks.
fn group_chunks(codeblocks: &[Codeblock], max_scale: u32) -> Result<Vec<DataChunk>, FormatError> {
    let mut chunks = Vec::new();
    let mut index = 0usize;

    while index < codeblocks.len() {
        let root = &codeblocks[index];
        let is_chunk_scale = root.scale == max_scale || root.scale % 3 == 2;
        if root.coefficient != COEFFICIENT_H || root.color != 0 || !is_chunk_scale {
            return Err(FormatError::InvalidGeometry(format!(
                "codeblock {} (scale {}, color {}) does not start a chunk",
                index, root.scale, root.color
            )));
        }

        let per_color = codeblocks_per_color(root.scale, max_scale);
        let count = per_color as usize * COLOR_COUNT;
        let members = codeblocks.get(index..index + count).ok_or_else(|| {
            FormatError::InvalidGeometry(format!(
                "chunk at codeblock {} needs {} codeblocks, {} remain",
                index,
                count,
                codeblocks.len() - index
            ))
        })?;

        let levels = levels_in_chunk(root.scale);
        for (i, cb) in members.iter().enumerate() {
            let position = i as u32 % per_color;
            let expected_scale = expected_scale(root.scale, position, levels);
            let expected_coefficient = if position == per_color - 1 && root.scale == max_scale {
                COEFFICIENT_LL
            } else {
                COEFFICIENT_H
            };
            if cb.scale != expected_scale
                || cb.coefficient != expected_coefficient
                || cb.color != i as u32 / per_color
            {
                return Err(FormatError::InvalidGeometry(format!(
                    "codeblock {} out of chunk order (scale {}, color {})",
                    index + i,
                    cb.scale,
                    cb.color
                )));
            }
        }

        let offset = members.iter().map(|cb| cb.offset).min().unwrap_or(0);
        let end = members.iter().map(Codeblock::end).max().unwrap_or(offset);
        chunks.push(DataChunk {
            offset,
            size: end - offset,
            top_scale: root.scale,
            levels,
            first_codeblock: index as u32,
            codeblocks_per_color: per_color,
        });
        index += count;
    }

    Ok(chunks)
}

/// Scale of the block at `position` within a chunk color group.
fn expected_scale(top_scale: u32, position: u32, levels: u32) -> u32 {
    let mut base = 0;
    for depth in 0..levels {
        let group = 1 << (2 * depth);
        if position < base + group {
            return top_scale - depth;
        }
        base += group;
    }
    // The trailing LL block
    top_scale
}
