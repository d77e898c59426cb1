//! Format-aware raster readers.
//!
//! Two drivers cover the supported containers:
//!
//! - [`GeoTiffReader`]: true windowed reads against TIFF/GeoTIFF without
//!   materializing the whole image. Feeds streaming tile generation.
//! - PSB/PSD composite loading ([`psd`]): the layered formats only expose a
//!   flattened composite, so metadata comes from the 26-byte header and tile
//!   generation requires a full in-memory composite, gated by a RAM check
//!   upstream.
//!
//! Band rules for RGB conversion: a single band is replicated to gray RGB,
//! three or more bands contribute their first three, anything else renders
//! black. Sixteen-bit samples are narrowed to eight by `>> 8`; sample types
//! outside {u8, u16} are rejected at open.

mod geotiff;
pub mod psd;

use std::path::Path;

use serde_json::Value;

pub use geotiff::GeoTiffReader;

use crate::error::RasterError;

/// Supported source containers, keyed on file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// TIFF / GeoTIFF: streaming window reads.
    GeoTiff,
    /// Photoshop PSB/PSD: whole-image composite.
    Composite,
}

impl SourceFormat {
    pub fn from_path(path: &Path) -> Result<Self, RasterError> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "tif" | "tiff" => Ok(SourceFormat::GeoTiff),
            "psb" | "psd" => Ok(SourceFormat::Composite),
            other => Err(RasterError::UnsupportedFormat {
                reason: format!("unrecognized extension: .{}", other),
            }),
        }
    }
}

/// Image-level metadata extracted at open time.
#[derive(Debug, Clone)]
pub struct RasterMetadata {
    pub width: u32,
    pub height: u32,
    pub bands: u8,
    pub bit_depth: u8,
    /// Spatial reference description, when the container carries one.
    pub projection: Option<String>,
    /// Affine geotransform `[origin_x, px_w, 0, origin_y, 0, -px_h]`.
    pub geotransform: Option<Value>,
    /// Geographic bounds `{west, south, east, north}`.
    pub bounds: Option<Value>,
}

/// Random-window access over a raster source.
///
/// Window reads return RGB buffers already converted per the band rules.
/// Reads take `&mut self` because the underlying decoders seek.
pub trait RasterReader {
    fn metadata(&self) -> &RasterMetadata;

    /// Read the rectangle `(left, top)..(left+width, top+height)`.
    ///
    /// The window must lie within the image. Corrupt source regions surface
    /// as [`RasterError::CorruptRegion`]; callers substitute black tiles.
    fn read_window(
        &mut self,
        left: u32,
        top: u32,
        width: u32,
        height: u32,
    ) -> Result<image::RgbImage, RasterError>;
}

/// Extract metadata without loading pixel data.
///
/// For TIFF this opens the decoder and reads the header tags; for PSB/PSD
/// it parses the fixed-size header only.
pub fn probe_metadata(path: &Path) -> Result<RasterMetadata, RasterError> {
    match SourceFormat::from_path(path)? {
        SourceFormat::GeoTiff => GeoTiffReader::open(path).map(|r| r.metadata().clone()),
        SourceFormat::Composite => psd::probe(path),
    }
}

// =============================================================================
// Tests
// =============================================================================
