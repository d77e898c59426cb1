//! Router construction.
//!
//! The API mounts under `/api`; `/health` and the preview alias
//! `/datasets/{id}_preview.jpg` sit at the root. CORS allows any origin so
//! browser viewers can export tiles to canvas.

use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::Method;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::server::state::AppState;
use crate::server::{datasets, tiles};
use crate::upload::CHUNK_SIZE;

/// Build the application router.
pub fn create_router(state: AppState, enable_tracing: bool) -> Router {
    // Chunk bodies carry one chunk plus multipart framing.
    let chunk_body_limit = (CHUNK_SIZE as usize) + 64 * 1024;

    let upload_routes = Router::new()
        .route("/datasets/upload/init", post(datasets::upload_init))
        .route(
            "/datasets/upload/chunk",
            post(datasets::upload_chunk).layer(DefaultBodyLimit::max(chunk_body_limit)),
        )
        .route("/datasets/upload/complete", post(datasets::upload_complete))
        .route("/datasets/upload/{upload_id}", delete(datasets::upload_cancel))
        .route(
            "/datasets/upload",
            post(datasets::upload_single_shot).layer(DefaultBodyLimit::disable()),
        );

    let dataset_routes = Router::new()
        .route("/datasets", get(datasets::list_datasets))
        .route(
            "/datasets/{id}",
            get(datasets::get_dataset)
                .put(datasets::update_dataset)
                .delete(datasets::delete_dataset),
        )
        .route("/datasets/{id}/status", get(datasets::dataset_status))
        .route("/datasets/{id}/reprocess", post(datasets::reprocess_dataset))
        .route("/stats", get(datasets::dataset_stats));

    let tile_routes = Router::new()
        .route("/tiles/{id}/batch", get(tiles::batch_tiles))
        .route("/tiles/{id}/cache-stats", get(tiles::cache_stats))
        .route("/tiles/{id}/info", get(tiles::tile_info))
        .route("/tiles/{id}/preview", get(tiles::dataset_preview))
        .route("/tiles/{id}/{z}/{x}/{filename}", get(tiles::get_tile));

    let api = upload_routes.merge(dataset_routes).merge(tile_routes);

    let router = Router::new()
        .nest("/api", api)
        .route("/health", get(datasets::health))
        .route("/datasets/{filename}", get(tiles::preview_alias))
        .with_state(state)
        .layer(build_cors_layer());

    if enable_tracing {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

/// CORS for browser-based deep-zoom viewers: any origin, read/write verbs.
fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::HEAD,
            Method::OPTIONS,
        ])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_origin(Any)
        .max_age(Duration::from_secs(86400))
}

// =============================================================================
// Tests
// =============================================================================
