//! Tile encoding helpers.
//!
//! Canonical tile output is lossless PNG with fast, deterministic encoder
//! settings, so regenerating a tile from the same inputs yields identical
//! bytes. JPEG is used only for preview thumbnails.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ImageEncoder, RgbImage};

use crate::error::TileError;

/// JPEG quality for preview thumbnails.
pub const PREVIEW_JPEG_QUALITY: u8 = 90;

/// Encode an RGB image as PNG.
pub fn encode_png(img: &RgbImage) -> Result<Vec<u8>, TileError> {
    let mut buffer = Vec::new();
    let encoder = PngEncoder::new_with_quality(
        &mut buffer,
        CompressionType::Fast,
        FilterType::Adaptive,
    );
    encoder
        .write_image(
            img.as_raw(),
            img.width(),
            img.height(),
            image::ExtendedColorType::Rgb8,
        )
        .map_err(|e| TileError::Encode(e.to_string()))?;
    Ok(buffer)
}

/// Encode an RGB image as JPEG at the given quality.
pub fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>, TileError> {
    let mut buffer = Cursor::new(Vec::new());
    let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
    encoder
        .encode_image(img)
        .map_err(|e| TileError::Encode(e.to_string()))?;
    Ok(buffer.into_inner())
}

/// An opaque black tile.
pub fn black_tile(tile_size: u32) -> RgbImage {
    RgbImage::new(tile_size, tile_size)
}

/// Pad an image smaller than the tile to full size with opaque black in the
/// bottom-right; content stays anchored at the top-left.
pub fn pad_to_tile(img: RgbImage, tile_size: u32) -> RgbImage {
    if img.dimensions() == (tile_size, tile_size) {
        return img;
    }
    let mut padded = RgbImage::new(tile_size, tile_size);
    image::imageops::overlay(&mut padded, &img, 0, 0);
    padded
}

// =============================================================================
// Tests
// =============================================================================
