//! Reversible 5/3 wavelet transform.
//!
//! Coefficients of one tile are interleaved before the inverse transform:
//!
//! ```text
//!          even x   odd x
//! even y │  LL    │  HL   │
//! odd y  │  LH    │  HH   │
//! ```
//!
//! A tile's `bw × bh` coefficient blocks expand to `2bw × 2bh` samples. The
//! lifting filter reaches one coefficient past each tile edge, so the
//! interleaved window is padded with [`MARGIN`] samples taken from each
//! existing neighbor. At the image border (no neighbor) the line is
//! symmetrically extended, which matches [`forward_2d`].

/// Interleaved samples borrowed from each present neighbor.
pub const MARGIN: usize = 2;

/// Coefficients of one tile for one color channel.
#[derive(Debug, Clone, Copy)]
pub struct TileCoefficients<'a> {
    /// `bw × bh` low-pass block
    pub ll: &'a [i16],
    /// HL, LH and HH blocks, `bw × bh` each
    pub h: &'a [i16],
}

/// A tile and its 8 neighbors, row-major from (-1, -1) to (1, 1).
///
/// Index 4 is the center tile. Absent entries are image borders or tiles that
/// do not exist.
#[derive(Debug, Clone, Copy, Default)]
pub struct Neighborhood<'a> {
    pub tiles: [Option<TileCoefficients<'a>>; 9],
}

impl<'a> Neighborhood<'a> {
    pub fn new(center: TileCoefficients<'a>) -> Self {
        let mut tiles = [None; 9];
        tiles[4] = Some(center);
        Self { tiles }
    }

    /// Slot for the neighbor at offset (`dx`, `dy`).
    pub fn slot(dx: i32, dy: i32) -> usize {
        ((dy + 1) * 3 + (dx + 1)) as usize
    }

    pub fn set(&mut self, dx: i32, dy: i32, coefficients: TileCoefficients<'a>) {
        self.tiles[Self::slot(dx, dy)] = Some(coefficients);
    }

    pub fn get(&self, dx: i32, dy: i32) -> Option<TileCoefficients<'a>> {
        self.tiles[Self::slot(dx, dy)]
    }

    fn has(&self, dx: i32, dy: i32) -> bool {
        self.get(dx, dy).is_some()
    }
}

// =============================================================================
// 1D lifting
// =============================================================================

/// Inverse 5/3 lifting of one interleaved line of even length.
pub fn inverse_1d(line: &mut [i32]) {
    let n = line.len();
    if n < 2 {
        return;
    }
    let half = n / 2;
    for k in 0..half {
        let prev = if k == 0 { line[1] } else { line[2 * k - 1] };
        line[2 * k] -= (prev + line[2 * k + 1] + 2) >> 2;
    }
    for k in 0..half {
        let next = if 2 * k + 2 < n { line[2 * k + 2] } else { line[2 * k] };
        line[2 * k + 1] += (line[2 * k] + next) >> 1;
    }
}

/// Forward 5/3 lifting of one line of even length, leaving it interleaved.
pub fn forward_1d(line: &mut [i32]) {
    let n = line.len();
    if n < 2 {
        return;
    }
    let half = n / 2;
    for k in 0..half {
        let next = if 2 * k + 2 < n { line[2 * k + 2] } else { line[2 * k] };
        line[2 * k + 1] -= (line[2 * k] + next) >> 1;
    }
    for k in 0..half {
        let prev = if k == 0 { line[1] } else { line[2 * k - 1] };
        line[2 * k] += (prev + line[2 * k + 1] + 2) >> 2;
    }
}

// =============================================================================
// 2D
// =============================================================================

/// One forward decomposition of a `width × height` image, in place.
///
/// Rows first, then columns. The result is interleaved as described in the
/// module docs. Both dimensions must be even.
pub fn forward_2d(image: &mut [i32], width: usize, height: usize) {
    for row in image.chunks_exact_mut(width).take(height) {
        forward_1d(row);
    }
    let mut column = vec![0i32; height];
    for x in 0..width {
        for (y, value) in column.iter_mut().enumerate() {
            *value = image[y * width + x];
        }
        forward_1d(&mut column);
        for (y, value) in column.iter().enumerate() {
            image[y * width + x] = *value;
        }
    }
}

/// Columns first, then rows: the exact inverse of [`forward_2d`].
pub fn inverse_2d(image: &mut [i32], width: usize, height: usize) {
    let mut column = vec![0i32; height];
    for x in 0..width {
        for (y, value) in column.iter_mut().enumerate() {
            *value = image[y * width + x];
        }
        inverse_1d(&mut column);
        for (y, value) in column.iter().enumerate() {
            image[y * width + x] = *value;
        }
    }
    for row in image.chunks_exact_mut(width).take(height) {
        inverse_1d(row);
    }
}

/// Interleaved sample at (`x`, `y`) of a tile's coefficient blocks.
#[inline]
fn interleaved_sample(tile: &TileCoefficients<'_>, x: usize, y: usize, bw: usize, bh: usize) -> i32 {
    let block = (y / 2) * bw + x / 2;
    let band = match (x % 2, y % 2) {
        (0, 0) => return i32::from(tile.ll[block]),
        (1, 0) => 0,
        (0, _) => 1,
        _ => 2,
    };
    i32::from(tile.h[band * bw * bh + block])
}

/// Reconstruct the `2bw × 2bh` samples of the center tile.
///
/// `out` receives the samples row-major, clamped to `i16`.
pub fn reconstruct(neighborhood: &Neighborhood<'_>, bw: usize, bh: usize, out: &mut [i16]) {
    let tile_w = 2 * bw;
    let tile_h = 2 * bh;
    let left = if neighborhood.has(-1, 0) { MARGIN } else { 0 };
    let right = if neighborhood.has(1, 0) { MARGIN } else { 0 };
    let top = if neighborhood.has(0, -1) { MARGIN } else { 0 };
    let bottom = if neighborhood.has(0, 1) { MARGIN } else { 0 };
    let width = left + tile_w + right;
    let height = top + tile_h + bottom;

    let mut window = vec![0i32; width * height];
    for wy in 0..height {
        let (dy, ly) = locate(wy, top, tile_h);
        for wx in 0..width {
            let (dx, lx) = locate(wx, left, tile_w);
            // Missing diagonals stay zero
            if let Some(tile) = neighborhood.get(dx, dy) {
                window[wy * width + wx] = interleaved_sample(&tile, lx, ly, bw, bh);
            }
        }
    }

    inverse_2d(&mut window, width, height);

    for (y, row) in out.chunks_exact_mut(tile_w).take(tile_h).enumerate() {
        let src = &window[(y + top) * width + left..][..tile_w];
        for (dst, &value) in row.iter_mut().zip(src) {
            *dst = value.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
        }
    }
}

/// Map a window coordinate to (tile offset, coordinate inside that tile).
#[inline]
fn locate(w: usize, margin: usize, extent: usize) -> (i32, usize) {
    if w < margin {
        (-1, extent - margin + w)
    } else if w < margin + extent {
        (0, w - margin)
    } else {
        (1, w - margin - extent)
    }
}

/// Copy quadrant (`qx`, `qy`) of reconstructed samples as a child's LL block.
pub fn extract_quadrant(samples: &[i16], bw: usize, bh: usize, qx: usize, qy: usize, ll: &mut [i16]) {
    let tile_w = 2 * bw;
    for (j, row) in ll.chunks_exact_mut(bw).take(bh).enumerate() {
        let start = (qy * bh + j) * tile_w + qx * bw;
        row.copy_from_slice(&samples[start..start + bw]);
    }
}

/// Split an interleaved `2bw × 2bh` region at (`x0`, `y0`) of an image into
/// LL and HL/LH/HH blocks.
#[allow(clippy::too_many_arguments)]
pub fn deinterleave(
    image: &[i32],
    image_width: usize,
    x0: usize,
    y0: usize,
    bw: usize,
    bh: usize,
    ll: &mut [i16],
    h: &mut [i16],
) {
    let block_len = bw * bh;
    for j in 0..bh {
        for i in 0..bw {
            let at = |dx: usize, dy: usize| {
                let v = image[(y0 + 2 * j + dy) * image_width + x0 + 2 * i + dx];
                v.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
            };
            let block = j * bw + i;
            ll[block] = at(0, 0);
            h[block] = at(1, 0);
            h[block_len + block] = at(0, 1);
            h[2 * block_len + block] = at(1, 1);
        }
    }
}
