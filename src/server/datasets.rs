//! Dataset endpoints: chunked and single-shot uploads, CRUD, status,
//! reprocess and stats.

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{Category, Dataset, DatasetStats, ProcessingStatus};
use crate::error::ApiError;
use crate::server::state::{AppState, HealthResponse, MessageResponse};
use crate::upload::{ChunkReceipt, UploadSessionInfo};

// =============================================================================
// Request / Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct InitUploadParams {
    pub filename: String,
    pub filesize: u64,
    pub total_chunks: u32,
}

#[derive(Debug, Deserialize)]
pub struct CompleteUploadParams {
    pub upload_id: String,
    pub name: String,
    pub description: Option<String>,
    pub category: String,
}

#[derive(Debug, Deserialize)]
pub struct SingleShotParams {
    pub name: String,
    pub description: Option<String>,
    pub category: String,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub category: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: ProcessingStatus,
    pub progress: i64,
    pub message: String,
}

fn parse_category(raw: &str) -> Result<Category, ApiError> {
    Category::parse(raw).ok_or_else(|| {
        ApiError::BadRequest(format!(
            "invalid category '{}' (expected earth, mars or space)",
            raw
        ))
    })
}

fn parse_upload_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("invalid upload id: {}", raw)))
}

// =============================================================================
// Health
// =============================================================================

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// =============================================================================
// Chunked Upload
// =============================================================================

/// `POST /api/datasets/upload/init`
pub async fn upload_init(
    State(state): State<AppState>,
    Query(params): Query<InitUploadParams>,
) -> Result<Json<UploadSessionInfo>, ApiError> {
    let info = state
        .assembler
        .init(&params.filename, params.filesize, params.total_chunks)
        .await?;
    Ok(Json(info))
}

/// `POST /api/datasets/upload/chunk` - multipart `upload_id, chunk_index, chunk`
pub async fn upload_chunk(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ChunkReceipt>, ApiError> {
    let mut upload_id: Option<Uuid> = None;
    let mut chunk_index: Option<u32> = None;
    let mut chunk: Option<bytes::Bytes> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {}", e)))?
    {
        match field.name() {
            Some("upload_id") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                upload_id = Some(parse_upload_id(&text)?);
            }
            Some("chunk_index") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                chunk_index = Some(text.parse().map_err(|_| {
                    ApiError::BadRequest(format!("invalid chunk index: {}", text))
                })?);
            }
            Some("chunk") => {
                chunk = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| ApiError::BadRequest(e.to_string()))?,
                );
            }
            _ => {}
        }
    }

    let upload_id =
        upload_id.ok_or_else(|| ApiError::BadRequest("missing upload_id field".to_string()))?;
    let chunk_index =
        chunk_index.ok_or_else(|| ApiError::BadRequest("missing chunk_index field".to_string()))?;
    let chunk = chunk.ok_or_else(|| ApiError::BadRequest("missing chunk field".to_string()))?;

    let receipt = state
        .assembler
        .append_chunk(upload_id, chunk_index, &chunk)
        .await?;
    Ok(Json(receipt))
}

/// `POST /api/datasets/upload/complete`
pub async fn upload_complete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<CompleteUploadParams>,
) -> Result<Response, ApiError> {
    let caller = state.caller(&headers).await?;
    let upload_id = parse_upload_id(&params.upload_id)?;
    let category = parse_category(&params.category)?;

    let assembled = state.assembler.complete(upload_id).await?;

    let created = state
        .processor
        .create_entry(
            &assembled.path,
            &params.name,
            params.description.clone(),
            category,
            caller.user(),
            false,
        )
        .await;

    let dataset = match created {
        Ok(dataset) => dataset,
        Err(e) => {
            // The assembled file has no row pointing at it; don't leak it.
            let _ = tokio::fs::remove_file(&assembled.path).await;
            return Err(e);
        }
    };

    let task_id = state.processor.spawn_tile_job(dataset.id, assembled.path);
    info!(dataset_id = dataset.id, task_id, "upload completed, tile job scheduled");

    Ok((StatusCode::CREATED, Json(dataset)).into_response())
}

/// `DELETE /api/datasets/upload/{upload_id}`
pub async fn upload_cancel(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    let upload_id = parse_upload_id(&upload_id)?;
    state.assembler.cancel(upload_id).await?;
    Ok(Json(MessageResponse::new(format!(
        "upload {} cancelled",
        upload_id
    ))))
}

/// `POST /api/datasets/upload` - single-shot multipart upload.
///
/// The file field streams to disk chunk by chunk; nothing buffers the whole
/// body in memory.
pub async fn upload_single_shot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<SingleShotParams>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let caller = state.caller(&headers).await?;
    let category = parse_category(&params.category)?;

    let mut saved: Option<std::path::PathBuf> = None;
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .ok_or_else(|| ApiError::BadRequest("file field missing a filename".to_string()))?
            .to_string();
        state.assembler.validate_single_shot(&filename, 0)?;

        let dest = state.assembler.upload_path(&filename);
        let mut file = tokio::fs::File::create(&dest)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        let mut written = 0u64;
        loop {
            let chunk = field
                .chunk()
                .await
                .map_err(|e| ApiError::BadRequest(format!("upload interrupted: {}", e)))?;
            let Some(chunk) = chunk else { break };

            written += chunk.len() as u64;
            if written > state.config.max_upload_size {
                drop(file);
                let _ = tokio::fs::remove_file(&dest).await;
                return Err(ApiError::PayloadTooLarge(format!(
                    "file exceeds the {} byte limit",
                    state.config.max_upload_size
                )));
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?;
        }
        file.flush()
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        saved = Some(dest);
        break;
    }

    let path = saved.ok_or_else(|| ApiError::BadRequest("missing file field".to_string()))?;

    let created = state
        .processor
        .create_entry(
            &path,
            &params.name,
            params.description.clone(),
            category,
            caller.user(),
            false,
        )
        .await;

    let dataset = match created {
        Ok(dataset) => dataset,
        Err(e) => {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }
    };

    let task_id = state.processor.spawn_tile_job(dataset.id, path);
    info!(dataset_id = dataset.id, task_id, "single-shot upload accepted");

    Ok((StatusCode::CREATED, Json(dataset)).into_response())
}

// =============================================================================
// Dataset CRUD
// =============================================================================

/// `GET /api/datasets`
pub async fn list_datasets(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Dataset>>, ApiError> {
    let caller = state.caller(&headers).await?;

    let category = params.category.as_deref().map(parse_category).transpose()?;
    let status = params
        .status
        .as_deref()
        .map(|raw| match raw {
            "pending" => Ok(ProcessingStatus::Pending),
            "processing" => Ok(ProcessingStatus::Processing),
            "completed" => Ok(ProcessingStatus::Completed),
            "failed" => Ok(ProcessingStatus::Failed),
            other => Err(ApiError::BadRequest(format!("invalid status '{}'", other))),
        })
        .transpose()?;

    let datasets = state
        .processor
        .list(&caller, category, status, params.skip, params.limit)
        .await?;
    Ok(Json(datasets))
}

/// `GET /api/datasets/{id}`
pub async fn get_dataset(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(dataset_id): Path<i64>,
) -> Result<Json<Dataset>, ApiError> {
    let caller = state.caller(&headers).await?;
    let dataset = state.processor.get(dataset_id, &caller).await?;
    Ok(Json(dataset))
}

/// `PUT /api/datasets/{id}`
pub async fn update_dataset(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(dataset_id): Path<i64>,
    Json(patch): Json<crate::processor::DatasetPatch>,
) -> Result<Json<Dataset>, ApiError> {
    let caller = state.caller(&headers).await?;
    let dataset = state.processor.update(dataset_id, patch, &caller).await?;
    Ok(Json(dataset))
}

/// `DELETE /api/datasets/{id}`
pub async fn delete_dataset(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(dataset_id): Path<i64>,
) -> Result<Json<MessageResponse>, ApiError> {
    let caller = state.caller(&headers).await?;
    state.processor.delete(dataset_id, &caller).await?;
    Ok(Json(MessageResponse::new(format!(
        "dataset {} deleted",
        dataset_id
    ))))
}

/// `GET /api/datasets/{id}/status`
pub async fn dataset_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(dataset_id): Path<i64>,
) -> Result<Json<StatusResponse>, ApiError> {
    let caller = state.caller(&headers).await?;
    let dataset = state.processor.get(dataset_id, &caller).await?;
    Ok(Json(StatusResponse {
        status: dataset.processing_status,
        progress: dataset.processing_progress,
        message: format!("Dataset is {}", dataset.processing_status.as_str()),
    }))
}

/// `POST /api/datasets/{id}/reprocess`
pub async fn reprocess_dataset(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(dataset_id): Path<i64>,
) -> Result<Json<MessageResponse>, ApiError> {
    let caller = state.caller(&headers).await?;
    let task_id = state.processor.reprocess(dataset_id, &caller).await?;
    warn!(dataset_id, task_id, "dataset reprocessing started");
    Ok(Json(MessageResponse::new(format!(
        "dataset {} reprocessing started",
        dataset_id
    ))))
}

/// `GET /api/stats`
pub async fn dataset_stats(
    State(state): State<AppState>,
) -> Result<Json<DatasetStats>, ApiError> {
    let stats = state.db.dataset_stats().await.map_err(ApiError::from)?;
    Ok(Json(stats))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_category() {
        assert_eq!(parse_category("earth").unwrap(), Category::Earth);
        assert_eq!(parse_category("mars").unwrap(), Category::Mars);
        assert_eq!(parse_category("space").unwrap(), Category::Space);
        assert!(parse_category("moon").is_err());
        assert!(parse_category("").is_err());
    }

    #[test]
    fn test_parse_upload_id() {
        let id = Uuid::new_v4();
        assert_eq!(parse_upload_id(&id.to_string()).unwrap(), id);
        assert!(parse_upload_id("not-a-uuid").is_err());
    }

    #[test]
    fn test_list_params_defaults() {
        let params: ListParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params.skip, 0);
        assert_eq!(params.limit, 100);
        assert!(params.category.is_none());
    }
}
