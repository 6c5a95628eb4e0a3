//! Ordered two-colour dithering against a fixed palette.
//!
//! Each pixel is approximated as a linear mix of its two nearest palette colours. The
//! mix fraction is compared with a tiled 8x8 threshold map, so the choice depends only
//! on colour and position (no error is carried between pixels).

use crate::palette::{Rgb, two_nearest};
use image::RgbImage;
use rayon::prelude::*;

/// Joel Yliluoma's 8x8 positional threshold map (each of 0..=63 exactly once).
#[rustfmt::skip]
pub const THRESHOLD_8: [[u8; 8]; 8] = [
    [ 0, 48, 12, 60,  3, 51, 15, 63],
    [32, 16, 44, 28, 35, 19, 47, 31],
    [ 8, 56,  4, 52, 11, 59,  7, 55],
    [40, 24, 36, 20, 43, 27, 39, 23],
    [ 2, 50, 14, 62,  1, 49, 13, 61],
    [34, 18, 46, 30, 33, 17, 45, 29],
    [10, 58,  6, 54,  9, 57,  5, 53],
    [42, 26, 38, 22, 41, 25, 37, 21],
];

const MATRIX_DIM: usize = 8;
const MATRIX_LEN: f64 = (MATRIX_DIM * MATRIX_DIM) as f64;

/// Normalised threshold in [0, 1) for a reduced-raster position.
#[inline(always)]
pub fn threshold(x: usize, y: usize) -> f64 {
    THRESHOLD_8[y % MATRIX_DIM][x % MATRIX_DIM] as f64 / MATRIX_LEN
}

#[inline(always)]
fn sub(a: Rgb, b: Rgb) -> [f64; 3] {
    [
        a[0] as f64 - b[0] as f64,
        a[1] as f64 - b[1] as f64,
        a[2] as f64 - b[2] as f64,
    ]
}

#[inline(always)]
fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Fraction of `c2` that best approximates `src` on the segment `c1..c2`.
///
/// Scalar projection of `src - c1` onto `c2 - c1`, clamped to [0, 1]; zero when the two
/// colours coincide.
pub fn mix_fraction(src: Rgb, c1: Rgb, c2: Rgb) -> f64 {
    let span = sub(c2, c1);
    let denom = dot(span, span);
    if denom <= 0.0 {
        return 0.0;
    }
    (dot(sub(src, c1), span) / denom).clamp(0.0, 1.0)
}

/// Pick between the closer colour `c1` and the runner-up `c2` for position (x, y).
#[inline(always)]
pub fn select(t: f64, x: usize, y: usize, c1: Rgb, c2: Rgb) -> Rgb {
    if t < threshold(x, y) { c1 } else { c2 }
}

/// Dither a single pixel. An empty palette leaves the colour untouched.
pub fn dither_pixel(src: Rgb, x: usize, y: usize, palette: &[Rgb]) -> Rgb {
    let Some(pair) = two_nearest(src, palette) else {
        return src;
    };
    let c1 = palette[pair.first];
    let c2 = palette[pair.second];
    select(mix_fraction(src, c1, c2), x, y, c1, c2)
}

/// Map every pixel of the reduced raster onto the palette.
///
/// Rows are processed in parallel; since each pixel depends only on its own colour and
/// position the result is identical to a sequential scan.
pub fn dither_reduced(reduced: &RgbImage, palette: &[Rgb]) -> RgbImage {
    let mut out = reduced.clone();
    let width = out.width() as usize;
    if width == 0 {
        return out;
    }
    let pixels: &mut [u8] = &mut out;
    pixels
        .par_chunks_mut(width * 3)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, px) in row.chunks_exact_mut(3).enumerate() {
                let chosen = dither_pixel([px[0], px[1], px[2]], x, y, palette);
                px.copy_from_slice(&chosen);
            }
        });
    out
}
