//! Shared application state, identity resolution and error mapping.

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::cache::TileCache;
use crate::config::Config;
use crate::db::MetadataStore;
use crate::error::ApiError;
use crate::identity::{Caller, UserIdentity};
use crate::processor::DatasetProcessor;
use crate::store::ObjectStore;
use crate::upload::UploadAssembler;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<DatasetProcessor>,
    pub assembler: Arc<UploadAssembler>,
    pub cache: Arc<TileCache>,
    pub store: ObjectStore,
    pub db: MetadataStore,
    pub config: Arc<Config>,
}

impl AppState {
    /// Resolve the caller from an optional `Authorization: Bearer` header.
    ///
    /// Absent header is an anonymous caller; a credential that resolves to
    /// no active account is rejected outright.
    pub async fn caller(&self, headers: &HeaderMap) -> Result<Caller, ApiError> {
        let Some(value) = headers.get(axum::http::header::AUTHORIZATION) else {
            return Ok(Caller::Anonymous);
        };

        let credential = value
            .to_str()
            .ok()
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("malformed authorization header".to_string()))?;

        let user = self
            .db
            .find_user_by_credential(credential)
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::Unauthorized("invalid credential".to_string()))?;

        Ok(Caller::User(UserIdentity::from(&user)))
    }
}

// =============================================================================
// Response Types
// =============================================================================

/// JSON error body returned for every error condition.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error class identifier (e.g. "not_found", "conflict")
    pub error: String,
    /// Human-readable message
    pub message: String,
}

/// Simple acknowledgement body.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }
}

/// Health check body.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

// =============================================================================
// Error Mapping
// =============================================================================

impl ApiError {
    fn class(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ApiError::PayloadTooLarge(_) => (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large"),
            ApiError::UnsupportedMedia(_) => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported_media_type")
            }
            ApiError::FailedDependency(_) => (StatusCode::FAILED_DEPENDENCY, "failed_dependency"),
            ApiError::ServiceUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, class) = self.class();
        let body = ErrorResponse {
            error: class.to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// =============================================================================
// Tests
// =============================================================================
