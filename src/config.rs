//! Configuration management for gigatile.
//!
//! All options can be set on the command line or through environment
//! variables. Paths are created on startup if missing.
//!
//! # Environment Variables
//!
//! - `TILES_DIR` - Local tile pyramid root (default: ./tiles)
//! - `UPLOAD_DIR` - Assembled upload destination (default: ./uploads)
//! - `DATASETS_DIR` - Preview thumbnails (default: ./datasets)
//! - `TEMP_DIR` - Chunked upload staging (default: ./temp)
//! - `TILE_SIZE` - Tile edge length in pixels (default: 256)
//! - `MAX_ZOOM_CAP` - Upper bound on computed max zoom (default: 30)
//! - `MAX_UPLOAD_SIZE` - Upload size limit in bytes (default: 40 GiB)
//! - `USE_S3` - Enable the object store tier (default: false)
//! - `AWS_BUCKET_NAME`, `AWS_REGION`, `S3_ENDPOINT_URL`, `R2_PUBLIC_URL`
//! - `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` - read by the AWS SDK
//!   credential chain directly
//! - `R2_UPLOAD_MAX_WORKERS` - Replication pool size (default: 20)
//! - `TILE_CACHE_CAPACITY` - In-process LRU entries (default: 500)
//! - `TILE_CACHE_WORKERS` - Parallel fetch permits (default: 50)
//! - `CLEANUP_INTERVAL_SECS` - Expiry sweep interval (default: 3600)

use std::path::PathBuf;

use clap::Parser;

// =============================================================================
// Default Values
// =============================================================================

/// Default server host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default server port.
pub const DEFAULT_PORT: u16 = 8000;

/// Default tile edge length in pixels.
pub const DEFAULT_TILE_SIZE: u32 = 256;

/// Default cap on the computed max zoom level.
pub const DEFAULT_MAX_ZOOM_CAP: u32 = 30;

/// Default upload size limit: 40 GiB.
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 40 * 1024 * 1024 * 1024;

/// Default replication worker pool size.
pub const DEFAULT_UPLOAD_WORKERS: usize = 20;

/// Default tile cache capacity (entries).
pub const DEFAULT_TILE_CACHE_CAPACITY: usize = 500;

/// Default tile cache fetch pool size.
pub const DEFAULT_TILE_CACHE_WORKERS: usize = 50;

/// Default expiry sweep interval: 1 hour.
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 3600;

// =============================================================================
// CLI Arguments
// =============================================================================

/// gigatile - ingestion pipeline and tile server for gigapixel imagery.
///
/// Accepts chunked uploads of GeoTIFF and PSB/PSD sources, materializes
/// deep-zoom PNG pyramids, replicates them to S3-compatible storage and
/// serves tiles to web viewers.
#[derive(Parser, Debug, Clone)]
#[command(name = "gigatile")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Host address to bind the server to.
    #[arg(long, default_value = DEFAULT_HOST, env = "GIGATILE_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "GIGATILE_PORT")]
    pub port: u16,

    // =========================================================================
    // Storage Paths
    // =========================================================================
    /// Root directory for generated tile pyramids.
    #[arg(long, default_value = "tiles", env = "TILES_DIR")]
    pub tiles_dir: PathBuf,

    /// Directory for assembled upload files.
    #[arg(long, default_value = "uploads", env = "UPLOAD_DIR")]
    pub upload_dir: PathBuf,

    /// Directory for preview thumbnails.
    #[arg(long, default_value = "datasets", env = "DATASETS_DIR")]
    pub datasets_dir: PathBuf,

    /// Staging directory for in-flight chunked uploads.
    #[arg(long, default_value = "temp", env = "TEMP_DIR")]
    pub temp_dir: PathBuf,

    /// SQLite database path (use ":memory:" for an ephemeral store).
    #[arg(long, default_value = "gigatile.db", env = "DATABASE_PATH")]
    pub database_path: String,

    // =========================================================================
    // Tile Settings
    // =========================================================================
    /// Tile edge length in pixels.
    #[arg(long, default_value_t = DEFAULT_TILE_SIZE, env = "TILE_SIZE")]
    pub tile_size: u32,

    /// Upper bound on the computed max zoom level.
    #[arg(long, default_value_t = DEFAULT_MAX_ZOOM_CAP, env = "MAX_ZOOM_CAP")]
    pub max_zoom_cap: u32,

    // =========================================================================
    // Upload Settings
    // =========================================================================
    /// Maximum accepted upload size in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_UPLOAD_SIZE, env = "MAX_UPLOAD_SIZE")]
    pub max_upload_size: u64,

    // =========================================================================
    // Object Store (Cloudflare R2 / AWS S3)
    // =========================================================================
    /// Enable the S3-compatible object store tier.
    #[arg(long, default_value_t = false, env = "USE_S3")]
    pub use_s3: bool,

    /// Bucket name for tiles, previews and dataset metadata.
    #[arg(long, default_value = "", env = "AWS_BUCKET_NAME")]
    pub bucket_name: String,

    /// AWS region ("auto" for R2).
    #[arg(long, default_value = "auto", env = "AWS_REGION")]
    pub aws_region: String,

    /// Custom endpoint URL for S3-compatible services (R2, MinIO).
    #[arg(long, env = "S3_ENDPOINT_URL")]
    pub s3_endpoint_url: Option<String>,

    /// Public-read base URL for the bucket (enables redirects and cache fetches).
    #[arg(long, env = "R2_PUBLIC_URL")]
    pub public_url: Option<String>,

    /// Replication worker pool size for tile uploads.
    #[arg(long, default_value_t = DEFAULT_UPLOAD_WORKERS, env = "R2_UPLOAD_MAX_WORKERS")]
    pub upload_workers: usize,

    // =========================================================================
    // Tile Cache
    // =========================================================================
    /// In-process tile cache capacity (entries).
    #[arg(long, default_value_t = DEFAULT_TILE_CACHE_CAPACITY, env = "TILE_CACHE_CAPACITY")]
    pub tile_cache_capacity: usize,

    /// Parallel fetch permits for the tile cache.
    #[arg(long, default_value_t = DEFAULT_TILE_CACHE_WORKERS, env = "TILE_CACHE_WORKERS")]
    pub tile_cache_workers: usize,

    // =========================================================================
    // Lifecycle
    // =========================================================================
    /// Expiry sweep interval in seconds.
    #[arg(long, default_value_t = DEFAULT_CLEANUP_INTERVAL_SECS, env = "CLEANUP_INTERVAL_SECS")]
    pub cleanup_interval_secs: u64,

    // =========================================================================
    // Logging
    // =========================================================================
    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Disable request tracing.
    #[arg(long, default_value_t = false)]
    pub no_tracing: bool,
}

impl Config {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.use_s3 && self.bucket_name.is_empty() {
            return Err(
                "object store is enabled but no bucket configured. \
                 Set --bucket-name or AWS_BUCKET_NAME, or disable with USE_S3=false"
                    .to_string(),
            );
        }

        if self.tile_size == 0 || !self.tile_size.is_power_of_two() {
            return Err("tile_size must be a power of two".to_string());
        }

        if self.max_upload_size == 0 {
            return Err("max_upload_size must be greater than 0".to_string());
        }

        if self.upload_workers == 0 {
            return Err("upload_workers must be greater than 0".to_string());
        }

        if self.tile_cache_capacity == 0 {
            return Err("tile_cache_capacity must be greater than 0".to_string());
        }
        if self.tile_cache_workers == 0 {
            return Err("tile_cache_workers must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Create the local storage directories if they do not exist.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        for dir in [
            &self.tiles_dir,
            &self.upload_dir,
            &self.datasets_dir,
            &self.temp_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Get the server bind address as "host:port".
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// SQLite connection URL for the configured database path.
    pub fn database_url(&self) -> String {
        if self.database_path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", self.database_path)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
