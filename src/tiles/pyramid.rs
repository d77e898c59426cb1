//! Pyramid geometry.
//!
//! Zoom `max_zoom` covers the source at 1:1 scale; each lower zoom halves
//! both axes. Scaled dimensions and tile counts use ceiling division so a
//! partial edge pixel still gets a (padded) tile.

use serde::Serialize;

/// Geometry of one zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ZoomLevel {
    pub zoom: u32,
    pub scaled_width: u32,
    pub scaled_height: u32,
    pub tiles_x: u32,
    pub tiles_y: u32,
}

impl ZoomLevel {
    pub fn tile_count(&self) -> u64 {
        self.tiles_x as u64 * self.tiles_y as u64
    }
}

/// Smallest zoom at which one tile covers the whole image:
/// `ceil(log2(max(width, height) / tile_size))`, never negative, clamped to
/// `cap`.
pub fn max_zoom_for(width: u32, height: u32, tile_size: u32, cap: u32) -> u32 {
    let max_dim = width.max(height).max(1) as u64;
    let tile = tile_size.max(1) as u64;

    let mut zoom = 0u32;
    while (tile << zoom) < max_dim && zoom < cap {
        zoom += 1;
    }
    zoom
}

/// Geometry of `zoom` for an image of the given dimensions.
pub fn zoom_level(width: u32, height: u32, tile_size: u32, max_zoom: u32, zoom: u32) -> ZoomLevel {
    debug_assert!(zoom <= max_zoom);
    let shift = max_zoom - zoom;

    let scaled_width = ceil_shift(width, shift);
    let scaled_height = ceil_shift(height, shift);

    ZoomLevel {
        zoom,
        scaled_width,
        scaled_height,
        tiles_x: scaled_width.div_ceil(tile_size),
        tiles_y: scaled_height.div_ceil(tile_size),
    }
}

/// Total tiles across all zooms `0..=max_zoom`.
pub fn total_tiles(width: u32, height: u32, tile_size: u32, max_zoom: u32) -> u64 {
    (0..=max_zoom)
        .map(|z| zoom_level(width, height, tile_size, max_zoom, z).tile_count())
        .sum()
}

/// `ceil(value / 2^shift)`, at least 1.
fn ceil_shift(value: u32, shift: u32) -> u32 {
    if shift == 0 {
        return value.max(1);
    }
    let divisor = 1u64 << shift;
    (((value as u64) + divisor - 1) >> shift).max(1) as u32
}

// =============================================================================
// Tests
// =============================================================================
