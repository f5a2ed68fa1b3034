//! Reversible YCoCg-R color transform.

/// Convert Y, Co, Cg planes to packed BGRA.
///
/// `out` must hold `4 × y.len()` bytes.
pub fn ycocg_to_bgra(y: &[i16], co: &[i16], cg: &[i16], out: &mut [u8]) {
    for (((pixel, &y), &co), &cg) in out.chunks_exact_mut(4).zip(y).zip(co).zip(cg) {
        let (r, g, b) = ycocg_to_rgb(i32::from(y), i32::from(co), i32::from(cg));
        pixel[0] = clamp_u8(b);
        pixel[1] = clamp_u8(g);
        pixel[2] = clamp_u8(r);
        pixel[3] = 255;
    }
}

#[inline]
pub fn ycocg_to_rgb(y: i32, co: i32, cg: i32) -> (i32, i32, i32) {
    let t = y - (cg >> 1);
    let g = cg + t;
    let b = t - (co >> 1);
    let r = b + co;
    (r, g, b)
}

#[inline]
pub fn rgb_to_ycocg(r: i32, g: i32, b: i32) -> (i32, i32, i32) {
    let co = r - b;
    let t = b + (co >> 1);
    let cg = g - t;
    let y = t + (cg >> 1);
    (y, co, cg)
}

#[inline]
fn clamp_u8(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// Convert packed BGRA to RGBA in place.
pub fn bgra_to_rgba(pixels: &mut [u8]) {
    for pixel in pixels.chunks_exact_mut(4) {
        pixel.swap(0, 2);
    }
}
