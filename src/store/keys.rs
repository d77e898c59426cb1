//! Object key scheme and tile formats.
//!
//! Every artifact the system persists to the object store lives under one of
//! three prefixes:
//!
//! - Tiles: `tiles/{dataset_id}/{z}/{x}/{y}.{format}`
//! - Previews: `previews/{dataset_id}_preview.jpg`
//! - Demo dataset metadata: `metadata/datasets/{dataset_id}.json`
//!
//! The same `{z}/{x}/{y}.{format}` shape is used for the local tile tree, so
//! replication is a straight key-for-path mapping.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Tile image format.
///
/// PNG is the canonical write format (lossless). JPG and WebP tiles may
/// exist from earlier generations; the tile server falls back between
/// formats when the requested one is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileFormat {
    Png,
    Jpg,
    Webp,
}

impl TileFormat {
    /// File extension (no leading dot).
    pub fn ext(&self) -> &'static str {
        match self {
            TileFormat::Png => "png",
            TileFormat::Jpg => "jpg",
            TileFormat::Webp => "webp",
        }
    }

    /// MIME type for HTTP responses.
    pub fn content_type(&self) -> &'static str {
        match self {
            TileFormat::Png => "image/png",
            TileFormat::Jpg => "image/jpeg",
            TileFormat::Webp => "image/webp",
        }
    }

    /// Parse from a file extension. Accepts "jpeg" as an alias for "jpg".
    pub fn from_ext(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(TileFormat::Png),
            "jpg" | "jpeg" => Some(TileFormat::Jpg),
            "webp" => Some(TileFormat::Webp),
            _ => None,
        }
    }

    /// Alternate formats to try when the requested one is missing, in order.
    pub fn fallbacks(&self) -> [TileFormat; 2] {
        match self {
            TileFormat::Jpg => [TileFormat::Png, TileFormat::Webp],
            TileFormat::Png => [TileFormat::Jpg, TileFormat::Webp],
            TileFormat::Webp => [TileFormat::Png, TileFormat::Jpg],
        }
    }
}

impl fmt::Display for TileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ext())
    }
}

/// Object key for a tile.
pub fn tile_key(dataset_id: i64, z: u32, x: u32, y: u32, format: TileFormat) -> String {
    format!("tiles/{}/{}/{}/{}.{}", dataset_id, z, x, y, format.ext())
}

/// Object key prefix covering every tile of a dataset.
pub fn tiles_prefix(dataset_id: i64) -> String {
    format!("tiles/{}/", dataset_id)
}

/// Object key for a dataset preview thumbnail.
pub fn preview_key(dataset_id: i64) -> String {
    format!("previews/{}_preview.jpg", dataset_id)
}

/// Object key for a persisted demo-dataset metadata document.
pub fn dataset_metadata_key(dataset_id: i64) -> String {
    format!("metadata/datasets/{}.json", dataset_id)
}

/// Prefix under which demo-dataset metadata documents live.
pub fn metadata_prefix() -> &'static str {
    "metadata/datasets/"
}

// =============================================================================
// Tests
// =============================================================================
