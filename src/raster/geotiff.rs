//! Streaming TIFF/GeoTIFF driver.
//!
//! TIFF stores pixel data in fixed-size chunks (tiles or strips). A window
//! read decodes only the chunks intersecting the window and assembles the
//! requested rectangle, so a 40 GB source never has to fit in memory.
//!
//! Decoded chunks pass through a small LRU so adjacent window reads (tile
//! generation sweeps the image column by column) don't re-decode the same
//! strip repeatedly.

use std::fs::File;
use std::io::BufReader;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::RgbImage;
use lru::LruCache;
use serde_json::json;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;
use tiff::ColorType;

use crate::error::RasterError;
use crate::raster::{RasterMetadata, RasterReader};

/// Decoded chunks kept around between window reads.
const CHUNK_CACHE_CAPACITY: usize = 16;

/// GeoTIFF tags for the affine transform and spatial reference.
const TAG_MODEL_PIXEL_SCALE: u16 = 33550;
const TAG_MODEL_TIEPOINT: u16 = 33922;
const TAG_GEO_ASCII_PARAMS: u16 = 34737;

/// Windowed reader over a TIFF/GeoTIFF file.
#[derive(Debug)]
pub struct GeoTiffReader {
    decoder: Decoder<BufReader<File>>,
    metadata: RasterMetadata,
    path: PathBuf,
    chunk_width: u32,
    chunk_height: u32,
    chunks_per_row: u32,
    /// Decoded chunks already converted to RGB, keyed by chunk index.
    chunk_cache: LruCache<u32, Arc<RgbImage>>,
}

impl GeoTiffReader {
    /// Open a TIFF file and read its header metadata.
    ///
    /// Rejects sample types outside {u8, u16} up front so window reads only
    /// ever see the two supported layouts.
    pub fn open(path: &Path) -> Result<Self, RasterError> {
        let file = File::open(path)?;
        let mut decoder = Decoder::new(BufReader::new(file)).map_err(|e| {
            RasterError::UnsupportedFormat {
                reason: format!("not a TIFF file: {}", e),
            }
        })?;

        let (width, height) = decoder
            .dimensions()
            .map_err(|e| RasterError::UnsupportedFormat {
                reason: format!("missing dimensions: {}", e),
            })?;

        let colortype = decoder
            .colortype()
            .map_err(|e| RasterError::UnsupportedFormat {
                reason: format!("missing color type: {}", e),
            })?;
        let (bands, bit_depth) = describe_colortype(colortype)?;

        let (projection, geotransform, bounds) = read_geo_tags(&mut decoder, width, height);

        let (chunk_width, chunk_height) = decoder.chunk_dimensions();
        let chunks_per_row = width.div_ceil(chunk_width).max(1);

        Ok(Self {
            decoder,
            metadata: RasterMetadata {
                width,
                height,
                bands,
                bit_depth,
                projection,
                geotransform,
                bounds,
            },
            path: path.to_path_buf(),
            chunk_width,
            chunk_height,
            chunks_per_row,
            chunk_cache: LruCache::new(NonZeroUsize::new(CHUNK_CACHE_CAPACITY).unwrap()),
        })
    }

    /// Decode one chunk to RGB, through the cache.
    fn chunk(&mut self, index: u32) -> Result<Arc<RgbImage>, RasterError> {
        if let Some(chunk) = self.chunk_cache.get(&index) {
            return Ok(chunk.clone());
        }

        let (data_width, data_height) = self.decoder.chunk_data_dimensions(index);
        let result = self.decoder.read_chunk(index).map_err(|e| {
            let col = index % self.chunks_per_row;
            let row = index / self.chunks_per_row;
            RasterError::CorruptRegion {
                left: col * self.chunk_width,
                top: row * self.chunk_height,
                width: data_width,
                height: data_height,
                message: e.to_string(),
            }
        })?;

        let rgb = samples_to_rgb(
            result,
            data_width,
            data_height,
            self.metadata.bands,
            &self.path,
        )?;

        let rgb = Arc::new(rgb);
        self.chunk_cache.put(index, rgb.clone());
        Ok(rgb)
    }
}

impl RasterReader for GeoTiffReader {
    fn metadata(&self) -> &RasterMetadata {
        &self.metadata
    }

    fn read_window(
        &mut self,
        left: u32,
        top: u32,
        width: u32,
        height: u32,
    ) -> Result<RgbImage, RasterError> {
        let meta = &self.metadata;
        if left + width > meta.width || top + height > meta.height || width == 0 || height == 0 {
            return Err(RasterError::WindowOutOfBounds {
                left,
                top,
                width,
                height,
                image_width: meta.width,
                image_height: meta.height,
            });
        }

        // Bands outside the convertible set render black.
        let bands = meta.bands;
        if bands != 1 && bands < 3 {
            return Ok(RgbImage::new(width, height));
        }

        let mut out = RgbImage::new(width, height);

        let first_row = top / self.chunk_height;
        let last_row = (top + height - 1) / self.chunk_height;
        let first_col = left / self.chunk_width;
        let last_col = (left + width - 1) / self.chunk_width;

        for chunk_row in first_row..=last_row {
            for chunk_col in first_col..=last_col {
                let index = chunk_row * self.chunks_per_row + chunk_col;
                let chunk = self.chunk(index)?;

                let chunk_left = chunk_col * self.chunk_width;
                let chunk_top = chunk_row * self.chunk_height;

                // Intersection of the window and this chunk, in image space.
                let ix0 = left.max(chunk_left);
                let iy0 = top.max(chunk_top);
                let ix1 = (left + width).min(chunk_left + chunk.width());
                let iy1 = (top + height).min(chunk_top + chunk.height());

                for y in iy0..iy1 {
                    for x in ix0..ix1 {
                        let pixel = chunk.get_pixel(x - chunk_left, y - chunk_top);
                        out.put_pixel(x - left, y - top, *pixel);
                    }
                }
            }
        }

        Ok(out)
    }
}

/// Map a TIFF color type to (bands, bit depth), rejecting unsupported
/// sample types.
fn describe_colortype(colortype: ColorType) -> Result<(u8, u8), RasterError> {
    let (bands, bits) = match colortype {
        ColorType::Gray(b) => (1, b),
        ColorType::GrayA(b) => (2, b),
        ColorType::RGB(b) => (3, b),
        ColorType::RGBA(b) => (4, b),
        ColorType::CMYK(b) => (4, b),
        other => {
            return Err(RasterError::UnsupportedFormat {
                reason: format!("unsupported color type: {:?}", other),
            })
        }
    };

    if bits != 8 && bits != 16 {
        return Err(RasterError::UnsupportedSampleType(format!("u{}", bits)));
    }

    Ok((bands, bits as u8))
}

/// Convert interleaved chunk samples to RGB per the band rules.
fn samples_to_rgb(
    result: DecodingResult,
    width: u32,
    height: u32,
    bands: u8,
    path: &Path,
) -> Result<RgbImage, RasterError> {
    let bands = bands as usize;
    let pixel_count = width as usize * height as usize;

    let narrowed: Vec<u8> = match result {
        DecodingResult::U8(data) => data,
        DecodingResult::U16(data) => data.iter().map(|&v| (v >> 8) as u8).collect(),
        _ => {
            // The open-time color type check keeps other layouts out; a
            // chunk disagreeing with the header is corrupt, not supported.
            return Err(RasterError::UnsupportedSampleType(format!(
                "unexpected sample layout in {}",
                path.display()
            )));
        }
    };

    if narrowed.len() < pixel_count * bands {
        return Err(RasterError::CorruptRegion {
            left: 0,
            top: 0,
            width,
            height,
            message: format!(
                "chunk truncated: {} samples for {} pixels x {} bands",
                narrowed.len(),
                pixel_count,
                bands
            ),
        });
    }

    let mut rgb = RgbImage::new(width, height);
    match bands {
        1 => {
            for (i, pixel) in rgb.pixels_mut().enumerate() {
                let v = narrowed[i];
                *pixel = image::Rgb([v, v, v]);
            }
        }
        n if n >= 3 => {
            for (i, pixel) in rgb.pixels_mut().enumerate() {
                let base = i * n;
                *pixel = image::Rgb([narrowed[base], narrowed[base + 1], narrowed[base + 2]]);
            }
        }
        // 2-band sources render black; handled before decoding.
        _ => {}
    }

    Ok(rgb)
}

/// Read GeoTIFF georeferencing tags, when present.
fn read_geo_tags(
    decoder: &mut Decoder<BufReader<File>>,
    width: u32,
    height: u32,
) -> (Option<String>, Option<serde_json::Value>, Option<serde_json::Value>) {
    let projection = decoder
        .get_tag_ascii_string(Tag::Unknown(TAG_GEO_ASCII_PARAMS))
        .ok()
        .map(|s| s.trim_matches(['\0', '|']).to_string())
        .filter(|s| !s.is_empty());

    let pixel_scale = decoder
        .get_tag_f64_vec(Tag::Unknown(TAG_MODEL_PIXEL_SCALE))
        .ok();
    let tiepoint = decoder
        .get_tag_f64_vec(Tag::Unknown(TAG_MODEL_TIEPOINT))
        .ok();

    let (geotransform, bounds) = match (pixel_scale, tiepoint) {
        (Some(scale), Some(tie)) if scale.len() >= 2 && tie.len() >= 5 => {
            // Tiepoint maps raster (i, j) to model (x, y): standard form is
            // a single point at raster origin.
            let (px_w, px_h) = (scale[0], scale[1]);
            let (origin_x, origin_y) = (tie[3] - tie[0] * px_w, tie[4] + tie[1] * px_h);

            let geotransform = json!([origin_x, px_w, 0.0, origin_y, 0.0, -px_h]);
            let bounds = json!({
                "west": origin_x,
                "north": origin_y,
                "east": origin_x + px_w * width as f64,
                "south": origin_y - px_h * height as f64,
            });
            (Some(geotransform), Some(bounds))
        }
        _ => (None, None),
    };

    (projection, geotransform, bounds)
}

// =============================================================================
// Tests
// =============================================================================
