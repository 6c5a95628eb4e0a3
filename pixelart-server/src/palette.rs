//! Fixed PICO-8 palette and the two-nearest-colour search used by the ditherer.

/// 8-bit RGB triple.
pub type Rgb = [u8; 3];

/// The 16 PICO-8 colours. Index order decides ties (first seen wins).
#[rustfmt::skip]
pub const PICO8: [Rgb; 16] = [
    [  0,   0,   0], [ 29,  43,  83], [126,  37,  83], [  0, 135,  81],
    [171,  82,  54], [ 95,  87,  79], [194, 195, 199], [255, 241, 232],
    [255,   0,  77], [255, 163,   0], [255, 236,  39], [  0, 228,  54],
    [ 41, 173, 255], [131, 118, 156], [255, 119, 168], [255, 204, 170],
];

/// Best and second-best palette entries for one colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NearestPair {
    pub first: usize,
    pub first_dist: u32,
    pub second: usize,
    pub second_dist: u32,
}

#[inline(always)]
pub fn color_sq_dist(a: Rgb, b: Rgb) -> u32 {
    let dr = a[0] as i32 - b[0] as i32;
    let dg = a[1] as i32 - b[1] as i32;
    let db = a[2] as i32 - b[2] as i32;
    (dr * dr + dg * dg + db * db) as u32
}

/// Linear scan for the two closest palette entries by squared RGB distance.
///
/// Comparisons are strict, so among equal distances the lower index is kept. When a
/// new best appears the previous best is demoted to second place. A palette with a
/// single entry reports that entry twice; an empty palette yields `None`.
pub fn two_nearest(color: Rgb, palette: &[Rgb]) -> Option<NearestPair> {
    let mut best: Option<(usize, u32)> = None;
    let mut runner_up: Option<(usize, u32)> = None;
    for (idx, &candidate) in palette.iter().enumerate() {
        let dist = color_sq_dist(color, candidate);
        match best {
            Some((_, d1)) if dist >= d1 => {
                if runner_up.is_none_or(|(_, d2)| dist < d2) {
                    runner_up = Some((idx, dist));
                }
            }
            _ => {
                runner_up = best;
                best = Some((idx, dist));
            }
        }
    }
    let (first, first_dist) = best?;
    let (second, second_dist) = runner_up.unwrap_or((first, first_dist));
    Some(NearestPair {
        first,
        first_dist,
        second,
        second_dist,
    })
}

/// `#rrggbb` form of a colour.
pub fn hex(c: Rgb) -> String {
    format!("#{:02x}{:02x}{:02x}", c[0], c[1], c[2])
}
