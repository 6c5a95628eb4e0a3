//! Image to pixel art: box downsample, palette match, ordered dither, nearest-neighbour upscale.

use crate::dither::dither_reduced;
use crate::palette::{PICO8, Rgb};
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageError, ImageFormat, RgbImage};
use std::io::Cursor;
use std::time::Instant;
use thiserror::Error;

/// Failures of a single conversion. Every variant is terminal for that call.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("could not decode source image: {0}")]
    DecodeFailure(#[source] ImageError),
    #[error("source image has no usable dimensions ({width}x{height})")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("pixel size must be at least 1 (got {0})")]
    InvalidPixelSize(u32),
    #[error("pixel size {pixel_size} is too large for a {width}x{height} image")]
    DegenerateScale {
        width: u32,
        height: u32,
        pixel_size: u32,
    },
    #[error("could not encode output image: {0}")]
    EncodeFailure(#[source] ImageError),
}

/// Size of the reduced raster for a source of `width x height` and block size `pixel_size`.
pub fn reduced_dims(width: u32, height: u32, pixel_size: u32) -> Result<(u32, u32), ConversionError> {
    if pixel_size == 0 {
        return Err(ConversionError::InvalidPixelSize(pixel_size));
    }
    if width == 0 || height == 0 {
        return Err(ConversionError::InvalidDimensions { width, height });
    }
    let (small_w, small_h) = (width / pixel_size, height / pixel_size);
    if small_w < 1 || small_h < 1 {
        return Err(ConversionError::DegenerateScale {
            width,
            height,
            pixel_size,
        });
    }
    Ok((small_w, small_h))
}

/// Decode encoded bytes (PNG/JPEG) into an RGB raster. Alpha is dropped.
pub fn decode_source(bytes: &[u8]) -> Result<RgbImage, ConversionError> {
    let img: DynamicImage =
        image::load_from_memory(bytes).map_err(ConversionError::DecodeFailure)?;
    Ok(img.to_rgb8())
}

/// Area-average downsample to `floor(W/S) x floor(H/S)`.
///
/// Uses the triangle kernel; `resize` widens its support by the scale factor so each
/// output cell blends its whole source block rather than sampling one pixel.
pub fn reduce(source: &RgbImage, pixel_size: u32) -> Result<RgbImage, ConversionError> {
    let (small_w, small_h) = reduced_dims(source.width(), source.height(), pixel_size)?;
    Ok(imageops::resize(source, small_w, small_h, FilterType::Triangle))
}

/// Nearest-neighbour blow-up of the reduced raster to exactly `width x height`.
pub fn upscale(small: &RgbImage, width: u32, height: u32) -> RgbImage {
    let (sw, sh) = (small.width() as u64, small.height() as u64);
    RgbImage::from_fn(width, height, |x, y| {
        let sx = (x as u64 * sw / width as u64) as u32;
        let sy = (y as u64 * sh / height as u64) as u32;
        *small.get_pixel(sx, sy)
    })
}

pub fn encode_png(img: &RgbImage) -> Result<Vec<u8>, ConversionError> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(ConversionError::EncodeFailure)?;
    Ok(bytes)
}

/// Downsample, palette-dither and upscale a decoded raster, returning the reduced
/// (dithered) raster alongside the full-size output.
pub fn pixelate(
    source: &RgbImage,
    pixel_size: u32,
    palette: &[Rgb],
) -> Result<(RgbImage, RgbImage), ConversionError> {
    let reduced = reduce(source, pixel_size)?;
    let dithered = dither_reduced(&reduced, palette);
    let output = upscale(&dithered, source.width(), source.height());
    Ok((dithered, output))
}

/// Full conversion: encoded source bytes in, PNG bytes of the same dimensions out.
pub fn convert(source: &[u8], pixel_size: u32) -> Result<Vec<u8>, ConversionError> {
    let started = Instant::now();
    let img = decode_source(source)?;
    let (width, height) = img.dimensions();
    let (small, output) = pixelate(&img, pixel_size, &PICO8)?;
    let png = encode_png(&output)?;
    tracing::debug!(
        width,
        height,
        pixel_size,
        small_w = small.width(),
        small_h = small.height(),
        bytes = png.len(),
        elapsed_ms = started.elapsed().as_millis(),
        "converted image to pixel art"
    );
    Ok(png)
}
