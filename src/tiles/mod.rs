//! Tile pyramid generation.
//!
//! The generator turns a raster source into a deep-zoom tree of fixed-size
//! PNG tiles on local disk:
//!
//! ```text
//! {tile_base_path}/{z}/{x}/{y}.png      z in 0..=max_zoom
//! ```
//!
//! The highest zoom is read from the source (windowed for TIFF, cropped
//! from the composite for PSB/PSD); every lower zoom is derived by halving
//! the four children above it. Corrupt source regions become opaque black
//! tiles so the pyramid stays complete.

mod encode;
mod generator;
mod pyramid;

pub use encode::{black_tile, encode_jpeg, encode_png, pad_to_tile};
pub use generator::{GenerationReport, ProgressFn, TileGenerator};
pub use pyramid::{max_zoom_for, total_tiles, zoom_level, ZoomLevel};
