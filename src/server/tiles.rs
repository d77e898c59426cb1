//! Tile serving endpoints: single tiles, batches, previews and viewer info.
//!
//! # Serving order for one tile
//!
//! 1. In-process cache (bytes inline, no redirect)
//! 2. Object store, when enabled and the tile is replicated: proxy-stream,
//!    falling back to a 302 redirect onto the public URL with a
//!    cache-bust token
//! 3. Local tile tree
//!
//! At both remote and local steps an absent format falls back to its
//! alternates (`jpg -> png -> webp`, `png -> jpg -> webp`,
//! `webp -> png -> jpg`); the response carries the format actually served.

use std::collections::BTreeMap;
use std::path::PathBuf;

use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::Json;
use base64::Engine;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::{CacheStats, TileKey};
use crate::db::Dataset;
use crate::error::ApiError;
use crate::identity::{check_access, Intent};
use crate::server::state::AppState;
use crate::store::{preview_key, tile_key, TileFormat};

/// Batch requests accept at most this many tile specs.
const MAX_BATCH_TILES: usize = 100;

/// Cache header for tiles (1 year, immutable).
const TILE_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

/// Cache header for previews (1 day).
const PREVIEW_CACHE_CONTROL: &str = "public, max-age=86400";

// =============================================================================
// Single Tile
// =============================================================================

/// `GET /api/tiles/{id}/{z}/{x}/{y}.{format}`
pub async fn get_tile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((dataset_id, z, x, filename)): Path<(i64, u32, u32, String)>,
) -> Result<Response, ApiError> {
    let (y, requested) = parse_tile_filename(&filename)?;
    let caller = state.caller(&headers).await?;

    let dataset = state.db.get_dataset(dataset_id).await.map_err(ApiError::from)?;
    check_access(&dataset, &caller, Intent::Read)?;

    // Mid-processing datasets may serve the tiles that already exist.
    if !dataset.servable() {
        return Err(ApiError::ServiceUnavailable(format!(
            "Dataset is {}",
            dataset.processing_status.as_str()
        )));
    }
    if z as i64 > dataset.max_zoom {
        return Err(ApiError::BadRequest(format!(
            "zoom level {} exceeds maximum {}",
            z, dataset.max_zoom
        )));
    }

    let cache_bust = dataset.cache_bust();

    // In-process cache first: microseconds, bytes inline.
    let key = TileKey::new(dataset_id, z, x, y, requested);
    if let Some(bytes) = state.cache.get(&key).await {
        debug!(dataset_id, z, x, y, "tile served from memory cache");
        return Ok(tile_response(&dataset, z, x, y, requested, bytes, "memory-cache"));
    }

    // Object store tier.
    if state.store.enabled() && state.store.has_public_url() {
        let mut format = requested;
        let mut on_store = dataset.tiles_uploaded_to_cloud();

        if !on_store {
            if probe_store(&state, dataset_id, z, x, y, requested).await {
                on_store = true;
            } else {
                for alt in requested.fallbacks() {
                    if probe_store(&state, dataset_id, z, x, y, alt).await {
                        format = alt;
                        on_store = true;
                        break;
                    }
                }
            }
        }

        if on_store {
            let object_key = tile_key(dataset_id, z, x, y, format);
            match state.store.get(&object_key).await {
                Ok((bytes, _content_type)) => {
                    debug!(dataset_id, z, x, y, "tile proxied from object store");
                    return Ok(tile_response(&dataset, z, x, y, format, bytes, "object-store"));
                }
                Err(e) => {
                    debug!(dataset_id, z, x, y, error = %e, "proxy failed, redirecting");
                    if let Some(url) = state.store.public_url(&object_key) {
                        let location = append_cache_bust(&url, cache_bust);
                        return Ok(redirect_response(&location, TILE_CACHE_CONTROL));
                    }
                }
            }
        }
        warn!(dataset_id, z, x, y, "tile not on object store, checking local disk");
    }

    // Local tile tree, with the same format fallback.
    let tile_base = PathBuf::from(&dataset.tile_base_path);
    let mut format = requested;
    let mut path = local_tile_path(&tile_base, z, x, y, format);

    if !path.exists() {
        let mut found = false;
        for alt in requested.fallbacks() {
            let candidate = local_tile_path(&tile_base, z, x, y, alt);
            if candidate.exists() {
                debug!(dataset_id, z, x, y, requested = %requested, served = %alt, "serving fallback format");
                path = candidate;
                format = alt;
                found = true;
                break;
            }
        }
        if !found {
            return Err(ApiError::NotFound(format!(
                "tile {}/{}/{} not found for dataset {}",
                z, x, y, dataset_id
            )));
        }
    }

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(tile_response(&dataset, z, x, y, format, Bytes::from(bytes), "local"))
}

async fn probe_store(
    state: &AppState,
    dataset_id: i64,
    z: u32,
    x: u32,
    y: u32,
    format: TileFormat,
) -> bool {
    state
        .store
        .exists(&tile_key(dataset_id, z, x, y, format))
        .await
        .unwrap_or(false)
}

fn local_tile_path(base: &std::path::Path, z: u32, x: u32, y: u32, format: TileFormat) -> PathBuf {
    base.join(z.to_string())
        .join(x.to_string())
        .join(format!("{}.{}", y, format.ext()))
}

fn tile_response(
    dataset: &Dataset,
    z: u32,
    x: u32,
    y: u32,
    format: TileFormat,
    body: Bytes,
    source: &str,
) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, format.content_type())
        .header(header::CACHE_CONTROL, TILE_CACHE_CONTROL)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header("Cross-Origin-Resource-Policy", "cross-origin")
        .header(
            header::ETAG,
            format!("\"{}-{}-{}-{}-{}\"", dataset.id, z, x, y, format.ext()),
        )
        .header("X-Tile-Format", format.ext())
        .header("X-Tile-Source", source)
        .body(Body::from(body))
        .expect("static headers")
}

fn redirect_response(location: &str, cache_control: &str) -> Response {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, location)
        .header(header::CACHE_CONTROL, cache_control)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(Body::empty())
        .expect("static headers")
}

/// Append the `v={cache_bust}` token, respecting an existing query string.
fn append_cache_bust(url: &str, cache_bust: i64) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}v={}", url, separator, cache_bust)
}

/// Parse the `{y}.{format}` tail of a tile path.
fn parse_tile_filename(filename: &str) -> Result<(u32, TileFormat), ApiError> {
    let (y_part, ext) = filename.rsplit_once('.').ok_or_else(|| {
        ApiError::BadRequest(format!("malformed tile filename: {}", filename))
    })?;
    let y = y_part
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid tile y coordinate: {}", y_part)))?;
    let format = TileFormat::from_ext(ext)
        .ok_or_else(|| ApiError::BadRequest(format!("unsupported tile format: {}", ext)))?;
    Ok((y, format))
}

// =============================================================================
// Batch
// =============================================================================

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub dataset_id: i64,
    pub count: usize,
    pub tiles: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_stats: Option<CacheStats>,
}

/// `GET /api/tiles/{id}/batch?tiles=z/x/y.fmt&tiles=...`
///
/// Access control is applied once for the dataset; at most
/// [`MAX_BATCH_TILES`] specs per request.
pub async fn batch_tiles(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(dataset_id): Path<i64>,
    RawQuery(query): RawQuery,
) -> Result<Json<BatchResponse>, ApiError> {
    let caller = state.caller(&headers).await?;
    let dataset = state.db.get_dataset(dataset_id).await.map_err(ApiError::from)?;
    check_access(&dataset, &caller, Intent::Read)?;

    let specs = parse_batch_query(query.as_deref().unwrap_or(""));
    if specs.len() > MAX_BATCH_TILES {
        return Err(ApiError::BadRequest(format!(
            "batch accepts at most {} tiles, got {}",
            MAX_BATCH_TILES,
            specs.len()
        )));
    }

    let mut keys = Vec::with_capacity(specs.len());
    for spec in &specs {
        let (z, x, y, format) = parse_tile_spec(spec)?;
        keys.push(TileKey::new(dataset_id, z, x, y, format));
    }

    if !(state.store.enabled() && state.store.has_public_url()) {
        return Ok(Json(BatchResponse {
            dataset_id,
            count: 0,
            tiles: BTreeMap::new(),
            error: Some("object store not configured".to_string()),
            cache_stats: None,
        }));
    }

    let results = state.cache.fetch_many(&state.store, &keys).await;

    let engine = base64::engine::general_purpose::STANDARD;
    let mut tiles = BTreeMap::new();
    for (key, data) in results {
        if let Some(bytes) = data {
            tiles.insert(key.coordinate(), engine.encode(&bytes));
        }
    }

    Ok(Json(BatchResponse {
        dataset_id,
        count: tiles.len(),
        tiles,
        error: None,
        cache_stats: Some(state.cache.stats().await),
    }))
}

/// Pull repeated `tiles=` values out of a raw query string.
fn parse_batch_query(query: &str) -> Vec<String> {
    query
        .split('&')
        .filter_map(|pair| pair.strip_prefix("tiles="))
        .map(|value| value.replace("%2F", "/").replace("%2f", "/"))
        .filter(|value| !value.is_empty())
        .collect()
}

/// Parse one `z/x/y.format` spec.
fn parse_tile_spec(spec: &str) -> Result<(u32, u32, u32, TileFormat), ApiError> {
    let malformed = || ApiError::BadRequest(format!("malformed tile spec: {}", spec));

    let mut parts = spec.splitn(3, '/');
    let z = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(malformed)?;
    let x = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(malformed)?;
    let (y, format) = parse_tile_filename(parts.next().ok_or_else(malformed)?)
        .map_err(|_| malformed())?;
    Ok((z, x, y, format))
}

/// `GET /api/tiles/{id}/cache-stats`
pub async fn cache_stats(
    State(state): State<AppState>,
    Path(dataset_id): Path<i64>,
) -> Json<Value> {
    Json(serde_json::json!({
        "dataset_id": dataset_id,
        "stats": state.cache.stats().await,
    }))
}

// =============================================================================
// Preview
// =============================================================================

/// `GET /api/tiles/{id}/preview`
pub async fn dataset_preview(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(dataset_id): Path<i64>,
) -> Result<Response, ApiError> {
    serve_preview(&state, &headers, dataset_id).await
}

/// `GET /datasets/{id}_preview.jpg` - legacy path shape used by viewers.
pub async fn preview_alias(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    let dataset_id = parse_preview_filename(&filename)
        .ok_or_else(|| ApiError::NotFound(format!("no such file: {}", filename)))?;
    serve_preview(&state, &headers, dataset_id).await
}

async fn serve_preview(
    state: &AppState,
    headers: &HeaderMap,
    dataset_id: i64,
) -> Result<Response, ApiError> {
    let caller = state.caller(headers).await?;
    let dataset = state.db.get_dataset(dataset_id).await.map_err(ApiError::from)?;
    check_access(&dataset, &caller, Intent::Read)?;

    let cache_bust = dataset.cache_bust();

    if state.store.enabled() && state.store.has_public_url() {
        // An explicit preview URL recorded at replication time wins over
        // the constructed one.
        let url = dataset
            .preview_url()
            .map(str::to_string)
            .or_else(|| state.store.public_url(&preview_key(dataset_id)));
        if let Some(url) = url {
            let location = append_cache_bust(&url, cache_bust);
            return Ok(redirect_response(&location, PREVIEW_CACHE_CONTROL));
        }
    }

    let path = state.processor.preview_path(dataset_id);
    if !path.exists() {
        return Err(ApiError::NotFound("preview not available".to_string()));
    }
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "image/jpeg")
        .header(header::CACHE_CONTROL, PREVIEW_CACHE_CONTROL)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header("Cross-Origin-Resource-Policy", "cross-origin")
        .body(Body::from(bytes))
        .expect("static headers"))
}

/// Parse `{id}_preview.jpg` into the dataset id.
fn parse_preview_filename(filename: &str) -> Option<i64> {
    filename
        .strip_suffix("_preview.jpg")
        .and_then(|id| id.parse().ok())
}

// =============================================================================
// Viewer Info
// =============================================================================

#[derive(Debug, Serialize)]
pub struct TileInfoResponse {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub width: i64,
    pub height: i64,
    #[serde(rename = "tileSize")]
    pub tile_size: i64,
    #[serde(rename = "minZoom")]
    pub min_zoom: i64,
    #[serde(rename = "maxZoom")]
    pub max_zoom: i64,
    #[serde(rename = "tilesUrl")]
    pub tiles_url: String,
    pub profile: &'static str,
    pub bounds: Option<Value>,
}

/// `GET /api/tiles/{id}/info` - deep-zoom viewer configuration.
pub async fn tile_info(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(dataset_id): Path<i64>,
) -> Result<Json<TileInfoResponse>, ApiError> {
    let caller = state.caller(&headers).await?;
    let dataset = state.db.get_dataset(dataset_id).await.map_err(ApiError::from)?;
    check_access(&dataset, &caller, Intent::Read)?;

    let bounds = dataset
        .bounds
        .as_ref()
        .map(|b| b.0.clone())
        .or_else(|| dataset.extra_metadata.get("bounds").cloned());

    Ok(Json(TileInfoResponse {
        kind: "zoomify",
        width: dataset.width,
        height: dataset.height,
        tile_size: dataset.tile_size,
        min_zoom: dataset.min_zoom,
        max_zoom: dataset.max_zoom,
        tiles_url: format!("/api/tiles/{}/{{z}}/{{x}}/{{y}}.png", dataset_id),
        profile: "level0",
        bounds,
    }))
}

// =============================================================================
// Tests
// =============================================================================
