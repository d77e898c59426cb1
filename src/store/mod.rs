//! Object store tier.
//!
//! An S3-compatible blob client (Cloudflare R2, AWS S3, MinIO) holding the
//! durable copies of tiles, previews and demo-dataset metadata documents,
//! published under a public-read URL prefix.

mod keys;
mod object_store;

pub use keys::{
    dataset_metadata_key, metadata_prefix, preview_key, tile_key, tiles_prefix, TileFormat,
};
pub use object_store::{create_s3_client, ObjectStore, MAX_PUT_ATTEMPTS};
