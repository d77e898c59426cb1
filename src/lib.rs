//! # gigatile
//!
//! An ingestion pipeline and tile server for gigapixel raster imagery.
//!
//! Very large sources (GeoTIFF and Photoshop PSB/PSD, up to ~40 GB) arrive
//! as chunked uploads, get materialized into deep-zoom PNG tile pyramids,
//! are replicated to S3-compatible object storage, and are served to web
//! viewers under per-dataset access control and expiry rules.
//!
//! ## Architecture
//!
//! - [`upload`] - chunked upload sessions and assembly
//! - [`raster`] - format-aware readers (streaming TIFF, PSB/PSD composite)
//! - [`tiles`] - pyramid math and the tile generator
//! - [`store`] - S3-compatible object store client and key scheme
//! - [`cache`] - in-process LRU tile cache with a parallel fetcher
//! - [`db`] - metadata store (users, datasets, annotations, jobs)
//! - [`processor`] - ingestion orchestration and lifecycle sweeps
//! - [`identity`] - caller identity and the dataset access policy
//! - [`server`] - axum HTTP layer
//! - [`config`] - CLI and environment configuration
//!
//! ## Ingest flow
//!
//! ```text
//! client ──▶ UploadAssembler ──▶ DatasetProcessor ──▶ TileGenerator
//!                                     │                   │
//!                                MetadataStore       local tile tree
//!                                     │                   │
//!                                     └──── ObjectStore ◀─┘
//! ```
//!
//! ## Serve flow
//!
//! ```text
//! client ──▶ AccessPolicy ──▶ TileCache ──▶ ObjectStore (proxy/redirect)
//!                                              └──▶ local disk fallback
//! ```

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod processor;
pub mod raster;
pub mod server;
pub mod store;
pub mod sys;
pub mod tiles;
pub mod upload;

// Re-export commonly used types
pub use cache::{CacheStats, TileCache, TileKey};
pub use config::Config;
pub use db::{
    Annotation, Category, Dataset, DatasetFilter, DatasetSeed, DatasetStats, MetadataStore,
    ProcessingJob, ProcessingStatus, User,
};
pub use error::{ApiError, DbError, RasterError, StoreError, TileError, UploadError};
pub use identity::{check_access, Caller, Intent, UserIdentity};
pub use processor::{DatasetPatch, DatasetProcessor, LifecycleManager};
pub use raster::{probe_metadata, GeoTiffReader, RasterMetadata, RasterReader, SourceFormat};
pub use server::{create_router, AppState};
pub use store::{
    create_s3_client, dataset_metadata_key, preview_key, tile_key, tiles_prefix, ObjectStore,
    TileFormat,
};
pub use tiles::{max_zoom_for, total_tiles, zoom_level, GenerationReport, TileGenerator, ZoomLevel};
pub use upload::{AssembledUpload, ChunkReceipt, UploadAssembler, UploadSessionInfo, CHUNK_SIZE};
