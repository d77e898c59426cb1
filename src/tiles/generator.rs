//! Deep-zoom tile pyramid generator.
//!
//! # Strategy
//!
//! ```text
//! TIFF / GeoTIFF          PSB / PSD
//!      │                      │
//!      ▼                      ▼
//! streaming mode         in-memory mode
//! (window reads at       (RAM-checked composite,
//!  max zoom, children     per-zoom LANCZOS scale,
//!  halved below)          crop + pad per tile)
//! ```
//!
//! Corrupt source windows become opaque black tiles and the job continues;
//! a whole zoom level failing is logged and skipped so lower zooms still
//! materialize. Progress runs 5 (validated), 10 (metadata), 10..95
//! (proportional per zoom), 100 (done).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use image::imageops::{self, FilterType as ResizeFilter};
use image::RgbImage;
use tracing::{error, info, warn};

use crate::error::TileError;
use crate::raster::{self, psd, GeoTiffReader, RasterReader, SourceFormat};
use crate::sys;
use crate::tiles::encode::{black_tile, encode_jpeg, encode_png, pad_to_tile, PREVIEW_JPEG_QUALITY};
use crate::tiles::pyramid::{max_zoom_for, zoom_level, ZoomLevel};

/// Monotone, non-blocking progress callback (0-100).
pub type ProgressFn = dyn Fn(u8) + Send + Sync;

/// Parallel tile encode only pays off for big zoom levels.
const PARALLEL_TILE_THRESHOLD: u64 = 10_000;

/// Parallel encode additionally requires this much free RAM.
const PARALLEL_MIN_AVAILABLE_RAM: u64 = 1 << 30;

/// Per-tile corruption warnings stop after this many incidents.
const CORRUPTED_LOG_LIMIT: u64 = 5;

/// Preview thumbnails never exceed this dimension.
const PREVIEW_MAX_DIM: u32 = 512;

/// Outcome of a generation run.
#[derive(Debug, Default, Clone)]
pub struct GenerationReport {
    pub max_zoom: u32,
    pub tiles_generated: u64,
    pub corrupted_tiles: u64,
    /// Zoom levels that failed wholesale and were skipped.
    pub skipped_zooms: Vec<u32>,
}

impl GenerationReport {
    fn new(max_zoom: u32) -> Self {
        Self {
            max_zoom,
            ..Default::default()
        }
    }

    /// Count a corrupted source region, with log suppression past the
    /// [`CORRUPTED_LOG_LIMIT`]th incident.
    fn note_corrupted(&mut self, zoom: u32, x: u32, y: u32, message: &str) {
        self.corrupted_tiles += 1;
        if self.corrupted_tiles <= CORRUPTED_LOG_LIMIT {
            warn!(zoom, x, y, message, "corrupted source region, writing black tile");
        } else if self.corrupted_tiles == CORRUPTED_LOG_LIMIT + 1 {
            warn!("multiple corrupted regions, suppressing further warnings");
        }
    }
}

/// Produces a PNG tile pyramid for one source file.
pub struct TileGenerator {
    input_file: PathBuf,
    output_dir: PathBuf,
    tile_size: u32,
    max_zoom_cap: u32,
}

impl TileGenerator {
    pub fn new(input_file: PathBuf, output_dir: PathBuf, tile_size: u32, max_zoom_cap: u32) -> Self {
        Self {
            input_file,
            output_dir,
            tile_size,
            max_zoom_cap,
        }
    }

    /// Generate the full pyramid, choosing the strategy by source format.
    ///
    /// Runs synchronously; callers put it on a blocking thread.
    pub fn generate(&self, progress: &ProgressFn) -> Result<GenerationReport, TileError> {
        let format = SourceFormat::from_path(&self.input_file).map_err(TileError::Raster)?;
        let metadata = raster::probe_metadata(&self.input_file)?;
        progress(5);

        let max_zoom = max_zoom_for(
            metadata.width,
            metadata.height,
            self.tile_size,
            self.max_zoom_cap,
        );
        info!(
            width = metadata.width,
            height = metadata.height,
            max_zoom,
            "starting tile generation"
        );
        progress(10);

        std::fs::create_dir_all(&self.output_dir)?;

        let report = match format {
            SourceFormat::GeoTiff => {
                let mut reader = GeoTiffReader::open(&self.input_file)?;
                self.generate_streaming(&mut reader, max_zoom, progress)?
            }
            SourceFormat::Composite => {
                let filesize = std::fs::metadata(&self.input_file)?.len();
                let needed = composite_memory_needed(filesize, metadata.width, metadata.height);
                let available = sys::available_memory();
                if available < needed {
                    return Err(TileError::InsufficientMemory { needed, available });
                }
                let composite = psd::load_composite(&self.input_file)?;
                self.generate_in_memory(&composite, max_zoom, progress)?
            }
        };

        progress(100);
        info!(
            tiles = report.tiles_generated,
            corrupted = report.corrupted_tiles,
            "tile generation complete"
        );
        Ok(report)
    }

    /// Streaming pyramid: max zoom from window reads, lower zooms halved
    /// from their four children.
    pub(crate) fn generate_streaming(
        &self,
        reader: &mut dyn RasterReader,
        max_zoom: u32,
        progress: &ProgressFn,
    ) -> Result<GenerationReport, TileError> {
        let meta = reader.metadata().clone();
        let total_levels = max_zoom as u64 + 1;
        let mut report = GenerationReport::new(max_zoom);
        let mut levels_done = 0u64;

        let level = zoom_level(meta.width, meta.height, self.tile_size, max_zoom, max_zoom);
        if let Err(e) = self.generate_max_zoom(reader, &level, &mut report) {
            error!(zoom = max_zoom, error = %e, "zoom level failed, skipping");
            report.skipped_zooms.push(max_zoom);
        }
        levels_done += 1;
        progress(zoom_progress(levels_done, total_levels));

        for zoom in (0..max_zoom).rev() {
            let level = zoom_level(meta.width, meta.height, self.tile_size, max_zoom, zoom);
            if let Err(e) = self.generate_zoom_from_children(&level) {
                error!(zoom, error = %e, "zoom level failed, skipping");
                report.skipped_zooms.push(zoom);
            } else {
                report.tiles_generated += level.tile_count();
            }
            levels_done += 1;
            progress(zoom_progress(levels_done, total_levels));
        }

        Ok(report)
    }

    /// In-memory pyramid: every zoom scaled directly from the loaded image.
    pub(crate) fn generate_in_memory(
        &self,
        source: &RgbImage,
        max_zoom: u32,
        progress: &ProgressFn,
    ) -> Result<GenerationReport, TileError> {
        let (width, height) = source.dimensions();
        let total_levels = max_zoom as u64 + 1;
        let mut report = GenerationReport::new(max_zoom);

        for zoom in 0..=max_zoom {
            let level = zoom_level(width, height, self.tile_size, max_zoom, zoom);

            let scaled_storage;
            let scaled: &RgbImage = if zoom == max_zoom {
                source
            } else {
                scaled_storage = imageops::resize(
                    source,
                    level.scaled_width,
                    level.scaled_height,
                    ResizeFilter::Lanczos3,
                );
                &scaled_storage
            };

            self.write_tiles_from_image(scaled, &level)?;
            report.tiles_generated += level.tile_count();

            progress(zoom_progress(zoom as u64 + 1, total_levels));
        }

        Ok(report)
    }

    /// Max-zoom generation from window reads. Failed windows turn into
    /// black tiles; only encode/write failures abort the level.
    fn generate_max_zoom(
        &self,
        reader: &mut dyn RasterReader,
        level: &ZoomLevel,
        report: &mut GenerationReport,
    ) -> Result<(), TileError> {
        let ts = self.tile_size;
        let meta = reader.metadata().clone();
        self.create_level_dirs(level)?;

        let parallel = level.tile_count() > PARALLEL_TILE_THRESHOLD
            && sys::available_memory() >= PARALLEL_MIN_AVAILABLE_RAM;

        let mut read_window = |x: u32, y: u32, report: &mut GenerationReport| -> RgbImage {
            let left = x * ts;
            let top = y * ts;
            let width = ts.min(meta.width - left);
            let height = ts.min(meta.height - top);
            match reader.read_window(left, top, width, height) {
                Ok(img) => img,
                Err(e) => {
                    report.note_corrupted(level.zoom, x, y, &e.to_string());
                    black_tile(ts)
                }
            }
        };

        if !parallel {
            for x in 0..level.tiles_x {
                for y in 0..level.tiles_y {
                    let img = read_window(x, y, report);
                    let tile = pad_to_tile(img, ts);
                    let bytes = encode_png(&tile)?;
                    std::fs::write(self.tile_path(level.zoom, x, y), bytes)?;
                    report.tiles_generated += 1;
                }
            }
            return Ok(());
        }

        // Pipeline: the (single) reader produces raw windows, a small pool
        // pads, encodes and writes. The bounded channel keeps at most
        // workers x 2 tile buffers alive.
        let workers = encode_workers();
        let written = AtomicU64::new(0);
        let failure: Mutex<Option<TileError>> = Mutex::new(None);
        info!(zoom = level.zoom, workers, "parallel tile encode");

        std::thread::scope(|scope| {
            let (tx, rx) = mpsc::sync_channel::<(u32, u32, RgbImage)>(workers * 2);
            let rx = Arc::new(Mutex::new(rx));

            for _ in 0..workers {
                let rx = Arc::clone(&rx);
                let written = &written;
                let failure = &failure;
                let zoom = level.zoom;
                scope.spawn(move || loop {
                    let job = { rx.lock().unwrap().recv() };
                    let Ok((x, y, img)) = job else { break };

                    let tile = pad_to_tile(img, ts);
                    let result = encode_png(&tile).and_then(|bytes| {
                        std::fs::write(self.tile_path(zoom, x, y), bytes).map_err(TileError::Io)
                    });
                    match result {
                        Ok(()) => {
                            written.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            *failure.lock().unwrap() = Some(e);
                            break;
                        }
                    }
                });
            }
            // Only workers hold the receiver now; if every worker exits,
            // sends fail instead of blocking forever.
            drop(rx);

            'produce: for x in 0..level.tiles_x {
                for y in 0..level.tiles_y {
                    if failure.lock().unwrap().is_some() {
                        break 'produce;
                    }
                    let img = read_window(x, y, report);
                    if tx.send((x, y, img)).is_err() {
                        break 'produce;
                    }
                }
            }
            drop(tx);
        });

        if let Some(e) = failure.into_inner().unwrap() {
            return Err(e);
        }
        report.tiles_generated += written.load(Ordering::Relaxed);
        Ok(())
    }

    /// Build one zoom level by halving the four children above it.
    fn generate_zoom_from_children(&self, level: &ZoomLevel) -> Result<(), TileError> {
        let ts = self.tile_size;
        self.create_level_dirs(level)?;

        let write_tile = |x: u32, y: u32| -> Result<(), TileError> {
            let tile = match self.compose_from_children(level.zoom + 1, x, y) {
                Ok(tile) => tile,
                Err(e) => {
                    warn!(zoom = level.zoom, x, y, error = %e, "child composition failed, writing black tile");
                    black_tile(ts)
                }
            };
            let bytes = encode_png(&tile)?;
            std::fs::write(self.tile_path(level.zoom, x, y), bytes)?;
            Ok(())
        };

        let parallel = level.tile_count() > PARALLEL_TILE_THRESHOLD
            && sys::available_memory() >= PARALLEL_MIN_AVAILABLE_RAM;

        if parallel {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(encode_workers())
                .build()
                .map_err(|e| TileError::Encode(e.to_string()))?;
            let coords: Vec<(u32, u32)> = (0..level.tiles_x)
                .flat_map(|x| (0..level.tiles_y).map(move |y| (x, y)))
                .collect();
            pool.install(|| {
                use rayon::prelude::*;
                coords.par_iter().try_for_each(|&(x, y)| write_tile(x, y))
            })?;
        } else {
            for x in 0..level.tiles_x {
                for y in 0..level.tiles_y {
                    write_tile(x, y)?;
                }
            }
        }

        Ok(())
    }

    /// Paste the four children onto a double-size black canvas, halve with
    /// LANCZOS. Absent children (edge clipping, skipped zooms) stay black.
    fn compose_from_children(
        &self,
        source_zoom: u32,
        x: u32,
        y: u32,
    ) -> Result<RgbImage, TileError> {
        let ts = self.tile_size;
        let mut canvas = RgbImage::new(ts * 2, ts * 2);

        for dx in 0..2u32 {
            for dy in 0..2u32 {
                let child_path = self.tile_path(source_zoom, x * 2 + dx, y * 2 + dy);
                if !child_path.exists() {
                    continue;
                }
                let child = image::open(&child_path)
                    .map_err(|e| TileError::Encode(e.to_string()))?
                    .to_rgb8();
                imageops::overlay(&mut canvas, &child, (dx * ts) as i64, (dy * ts) as i64);
            }
        }

        Ok(imageops::resize(&canvas, ts, ts, ResizeFilter::Lanczos3))
    }

    /// Crop, pad and write every tile of one zoom from a scaled image.
    fn write_tiles_from_image(
        &self,
        scaled: &RgbImage,
        level: &ZoomLevel,
    ) -> Result<(), TileError> {
        let ts = self.tile_size;
        self.create_level_dirs(level)?;

        let write_tile = |x: u32, y: u32| -> Result<(), TileError> {
            let left = x * ts;
            let top = y * ts;
            let width = ts.min(level.scaled_width - left);
            let height = ts.min(level.scaled_height - top);

            let crop = imageops::crop_imm(scaled, left, top, width, height).to_image();
            let tile = pad_to_tile(crop, ts);
            let bytes = encode_png(&tile)?;
            std::fs::write(self.tile_path(level.zoom, x, y), bytes)?;
            Ok(())
        };

        let parallel = level.tile_count() > PARALLEL_TILE_THRESHOLD
            && sys::available_memory() >= PARALLEL_MIN_AVAILABLE_RAM;

        if parallel {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(encode_workers())
                .build()
                .map_err(|e| TileError::Encode(e.to_string()))?;
            let coords: Vec<(u32, u32)> = (0..level.tiles_x)
                .flat_map(|x| (0..level.tiles_y).map(move |y| (x, y)))
                .collect();
            pool.install(|| {
                use rayon::prelude::*;
                coords.par_iter().try_for_each(|&(x, y)| write_tile(x, y))
            })?;
        } else {
            for x in 0..level.tiles_x {
                for y in 0..level.tiles_y {
                    write_tile(x, y)?;
                }
            }
        }

        Ok(())
    }

    /// Produce a JPEG thumbnail (max dimension 512, quality 90) from the
    /// generated pyramid, so no second pass over the source is needed.
    pub fn generate_preview(&self, preview_path: &Path) -> Result<(), TileError> {
        let meta = raster::probe_metadata(&self.input_file)?;
        let max_zoom = max_zoom_for(meta.width, meta.height, self.tile_size, self.max_zoom_cap);

        // Deepest zoom whose full extent fits the preview budget.
        let max_dim = meta.width.max(meta.height) as u64;
        let mut shift = 0u32;
        while shift < max_zoom && max_dim.div_ceil(1 << shift) > PREVIEW_MAX_DIM as u64 {
            shift += 1;
        }
        let zoom = max_zoom - shift;
        let level = zoom_level(meta.width, meta.height, self.tile_size, max_zoom, zoom);

        let ts = self.tile_size;
        let mut canvas = RgbImage::new(level.tiles_x * ts, level.tiles_y * ts);
        for x in 0..level.tiles_x {
            for y in 0..level.tiles_y {
                let path = self.tile_path(zoom, x, y);
                if !path.exists() {
                    continue;
                }
                let tile = image::open(&path)
                    .map_err(|e| TileError::Encode(e.to_string()))?
                    .to_rgb8();
                imageops::overlay(&mut canvas, &tile, (x * ts) as i64, (y * ts) as i64);
            }
        }

        // Trim tile padding, then shrink if the ceiling rounded us over.
        let mut content =
            imageops::crop_imm(&canvas, 0, 0, level.scaled_width, level.scaled_height).to_image();
        let largest = content.width().max(content.height());
        if largest > PREVIEW_MAX_DIM {
            let w = (content.width() as u64 * PREVIEW_MAX_DIM as u64 / largest as u64).max(1);
            let h = (content.height() as u64 * PREVIEW_MAX_DIM as u64 / largest as u64).max(1);
            content = imageops::resize(&content, w as u32, h as u32, ResizeFilter::Lanczos3);
        }

        if let Some(parent) = preview_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = encode_jpeg(&content, PREVIEW_JPEG_QUALITY)?;
        std::fs::write(preview_path, bytes)?;
        info!(path = %preview_path.display(), "preview written");
        Ok(())
    }

    fn tile_path(&self, zoom: u32, x: u32, y: u32) -> PathBuf {
        self.output_dir
            .join(zoom.to_string())
            .join(x.to_string())
            .join(format!("{}.png", y))
    }

    fn create_level_dirs(&self, level: &ZoomLevel) -> Result<(), TileError> {
        for x in 0..level.tiles_x {
            std::fs::create_dir_all(
                self.output_dir
                    .join(level.zoom.to_string())
                    .join(x.to_string()),
            )?;
        }
        Ok(())
    }
}

/// 10 -> 95 proportionally by completed zoom levels.
fn zoom_progress(levels_done: u64, total_levels: u64) -> u8 {
    (10 + (85 * levels_done / total_levels).min(85)) as u8
}

/// Composite loading budget: three bytes per pixel, floor of three times
/// the on-disk size for heavily compressed documents.
fn composite_memory_needed(filesize: u64, width: u32, height: u32) -> u64 {
    (3 * filesize).max(3 * width as u64 * height as u64)
}

/// Encode pool size: `min(2, cpu_count)`.
fn encode_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(2)
}

// =============================================================================
// Tests
// =============================================================================
