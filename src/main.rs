//! gigatile - ingestion pipeline and tile server for gigapixel imagery.
//!
//! This binary wires the components together and starts the HTTP server.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gigatile::cache::TileCache;
use gigatile::config::Config;
use gigatile::db::MetadataStore;
use gigatile::processor::{DatasetProcessor, LifecycleManager};
use gigatile::server::{create_router, AppState};
use gigatile::store::ObjectStore;
use gigatile::upload::UploadAssembler;

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }
    if let Err(e) = config.ensure_directories() {
        error!("Failed to create storage directories: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Configuration:");
    info!("  tiles dir: {}", config.tiles_dir.display());
    info!("  upload dir: {}", config.upload_dir.display());
    info!("  database: {}", config.database_path);
    if config.use_s3 {
        info!("  object store: bucket '{}'", config.bucket_name);
        if let Some(ref endpoint) = config.s3_endpoint_url {
            info!("  object store endpoint: {}", endpoint);
        }
        match config.public_url {
            Some(ref url) => info!("  public URL: {}", url),
            None => warn!("  object store enabled without a public URL; no redirects or cache fetches"),
        }
    } else {
        info!("  object store: disabled (tiles served from local disk)");
    }

    let config = Arc::new(config);

    // Metadata store
    let db = match MetadataStore::connect(&config.database_url()).await {
        Ok(db) => db,
        Err(e) => {
            error!("Failed to open database: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Object store tier
    let store = ObjectStore::connect(&config).await;

    // Process-wide tile cache
    let cache = Arc::new(TileCache::new(
        config.tile_cache_capacity,
        config.tile_cache_workers,
    ));

    // Upload assembler
    let assembler = Arc::new(UploadAssembler::new(
        config.temp_dir.clone(),
        config.upload_dir.clone(),
        config.max_upload_size,
    ));

    // Ingestion orchestration
    let processor = Arc::new(DatasetProcessor::new(
        db.clone(),
        store.clone(),
        Arc::clone(&cache),
        Arc::clone(&config),
    ));

    // Lifecycle: reconcile persisted demo datasets, then start the sweeper.
    let lifecycle = Arc::new(LifecycleManager::new(
        Arc::clone(&processor),
        db.clone(),
        store.clone(),
        Duration::from_secs(config.cleanup_interval_secs),
    ));
    match lifecycle.reconcile_startup().await {
        Ok(0) => {}
        Ok(restored) => info!(restored, "restored demo datasets from object store"),
        Err(e) => warn!("Startup reconciliation failed: {}", e),
    }
    tokio::spawn(Arc::clone(&lifecycle).run());

    let state = AppState {
        processor,
        assembler,
        cache,
        store,
        db,
        config: Arc::clone(&config),
    };
    let router = create_router(state, !config.no_tracing);

    let addr = config.bind_address();
    info!("Server listening on http://{}", addr);
    info!("  health:   curl http://{}/health", addr);
    info!("  datasets: curl http://{}/api/datasets", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = axum::serve(listener, router).await {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "gigatile=debug,tower_http=debug"
    } else {
        "gigatile=info,tower_http=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
