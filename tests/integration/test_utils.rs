//! Test utilities for integration tests.
//!
//! Builds a complete application (in-memory database, disabled object
//! store, temp directories) plus helpers for synthesizing TIFF sources and
//! driving datasets through ingestion.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use axum::Router;
use tempfile::TempDir;
use tiff::encoder::{colortype, TiffEncoder};

use gigatile::cache::TileCache;
use gigatile::config::Config;
use gigatile::db::{Category, Dataset, MetadataStore};
use gigatile::identity::{Caller, UserIdentity};
use gigatile::processor::DatasetProcessor;
use gigatile::server::{create_router, AppState};
use gigatile::store::ObjectStore;
use gigatile::upload::UploadAssembler;

/// A fully wired application over temp storage.
pub struct TestApp {
    /// Keeps the temp tree alive for the duration of the test.
    #[allow(dead_code)]
    pub root: TempDir,
    pub state: AppState,
    pub router: Router,
}

impl TestApp {
    /// Path for a synthetic source file inside the upload directory.
    pub fn upload_path(&self, filename: &str) -> PathBuf {
        self.state.config.upload_dir.join(filename)
    }

    /// Insert a user whose bearer credential is `token`.
    pub async fn add_user(&self, username: &str, token: &str) -> UserIdentity {
        let user = self
            .state
            .db
            .insert_user(
                &format!("{}@example.com", username),
                username,
                token,
                None,
                false,
            )
            .await
            .unwrap();
        UserIdentity::from(&user)
    }

    /// Create a dataset entry and run its ingestion job to completion.
    pub async fn ingest(
        &self,
        filename: &str,
        name: &str,
        owner: Option<&UserIdentity>,
        is_demo: bool,
    ) -> Dataset {
        let path = self.upload_path(filename);
        let dataset = self
            .state
            .processor
            .create_entry(&path, name, None, Category::Space, owner, is_demo)
            .await
            .unwrap();
        self.state
            .processor
            .run_tile_job(dataset.id, &path, &format!("test-task-{}", dataset.id))
            .await
            .unwrap();
        self.state.db.get_dataset(dataset.id).await.unwrap()
    }

    /// Create a dataset entry without running the tile job.
    pub async fn create_pending(&self, filename: &str, name: &str) -> Dataset {
        let path = self.upload_path(filename);
        self.state
            .processor
            .create_entry(&path, name, None, Category::Space, None, false)
            .await
            .unwrap()
    }
}

/// Build a test application.
pub async fn test_app() -> TestApp {
    let root = TempDir::new().unwrap();

    let config = Arc::new(Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        tiles_dir: root.path().join("tiles"),
        upload_dir: root.path().join("uploads"),
        datasets_dir: root.path().join("datasets"),
        temp_dir: root.path().join("temp"),
        database_path: ":memory:".to_string(),
        tile_size: 256,
        max_zoom_cap: 30,
        max_upload_size: 64 * 1024 * 1024,
        use_s3: false,
        bucket_name: String::new(),
        aws_region: "auto".to_string(),
        s3_endpoint_url: None,
        public_url: None,
        upload_workers: 4,
        tile_cache_capacity: 100,
        tile_cache_workers: 4,
        cleanup_interval_secs: 3600,
        verbose: false,
        no_tracing: true,
    });
    config.ensure_directories().unwrap();

    let db = MetadataStore::connect("sqlite::memory:").await.unwrap();
    let store = ObjectStore::disabled();
    let cache = Arc::new(TileCache::new(
        config.tile_cache_capacity,
        config.tile_cache_workers,
    ));
    let assembler = Arc::new(UploadAssembler::new(
        config.temp_dir.clone(),
        config.upload_dir.clone(),
        config.max_upload_size,
    ));
    let processor = Arc::new(DatasetProcessor::new(
        db.clone(),
        store.clone(),
        Arc::clone(&cache),
        Arc::clone(&config),
    ));

    let state = AppState {
        processor,
        assembler,
        cache,
        store,
        db,
        config,
    };
    let router = create_router(state.clone(), false);

    TestApp {
        root,
        state,
        router,
    }
}

/// Write a gradient RGB strip TIFF at `path`.
pub fn write_rgb_tiff(path: &Path, width: u32, height: u32) {
    let mut buffer = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            buffer.push((x % 256) as u8);
            buffer.push((y % 256) as u8);
            buffer.push(60);
        }
    }

    let mut bytes = Cursor::new(Vec::new());
    let mut encoder = TiffEncoder::new(&mut bytes).unwrap();
    encoder
        .write_image::<colortype::RGB8>(width, height, &buffer)
        .unwrap();
    std::fs::write(path, bytes.into_inner()).unwrap();
}

/// Raw bytes of a small RGB TIFF (for multipart upload bodies).
pub fn rgb_tiff_bytes(width: u32, height: u32) -> Vec<u8> {
    let buffer: Vec<u8> = (0..width as usize * height as usize)
        .flat_map(|i| [(i % 256) as u8, ((i / 7) % 256) as u8, 42])
        .collect();
    let mut bytes = Cursor::new(Vec::new());
    let mut encoder = TiffEncoder::new(&mut bytes).unwrap();
    encoder
        .write_image::<colortype::RGB8>(width, height, &buffer)
        .unwrap();
    bytes.into_inner()
}

/// Build a `multipart/form-data` body. Each field is
/// `(name, optional filename, content)`.
pub fn multipart_body(boundary: &str, fields: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, filename, content) in fields {
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        match filename {
            Some(fname) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n",
                    name, fname
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
            ),
        }
        body.extend_from_slice(content);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
    body
}

/// GET request builder, optionally authenticated.
pub fn get_request(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

/// System caller shorthand.
pub fn system() -> Caller {
    Caller::System
}
