//! Entity models persisted by the metadata store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;

/// Dataset processing lifecycle state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }
}

/// Dataset category.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Earth,
    Mars,
    Space,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Earth => "earth",
            Category::Mars => "mars",
            Category::Space => "space",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "earth" => Some(Category::Earth),
            "mars" => Some(Category::Mars),
            "space" => Some(Category::Space),
            _ => None,
        }
    }
}

/// A registered user. Creation and credential handling are external; the
/// pipeline only reads these rows for ownership checks.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub credential_hash: String,
    pub full_name: Option<String>,
    pub is_active: bool,
    pub is_superuser: bool,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

/// A gigapixel image with its tile pyramid.
///
/// Serialized whole as the demo-dataset metadata document persisted to the
/// object store, so demo rows survive ephemeral hosts.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Dataset {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub category: Category,
    pub owner_id: Option<i64>,
    pub is_demo: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub original_file_path: String,
    pub tile_base_path: String,
    pub width: i64,
    pub height: i64,
    pub tile_size: i64,
    pub min_zoom: i64,
    pub max_zoom: i64,
    pub projection: Option<String>,
    pub geotransform: Option<Json<Value>>,
    pub bounds: Option<Json<Value>>,
    pub extra_metadata: Json<Value>,
    pub processing_status: ProcessingStatus,
    pub processing_progress: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Dataset {
    /// Whether tile replication to the object store finished.
    pub fn tiles_uploaded_to_cloud(&self) -> bool {
        self.extra_metadata
            .get("tiles_uploaded_to_cloud")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Explicit preview URL recorded at replication time, if any.
    pub fn preview_url(&self) -> Option<&str> {
        self.extra_metadata
            .get("preview_url")
            .and_then(Value::as_str)
    }

    /// Cache-bust token: second-precision timestamp of the last change.
    ///
    /// Appended to tile URLs so downstream caches invalidate when a dataset
    /// is reprocessed or its id is reused.
    pub fn cache_bust(&self) -> i64 {
        self.updated_at.timestamp().max(self.created_at.timestamp())
    }

    /// Whether tiles may be served (completed, or mid-processing with a
    /// partial tree).
    pub fn servable(&self) -> bool {
        matches!(
            self.processing_status,
            ProcessingStatus::Completed | ProcessingStatus::Processing
        )
    }
}

/// Seed values for inserting a new dataset row before metadata extraction.
#[derive(Debug, Clone)]
pub struct DatasetSeed {
    pub name: String,
    pub description: Option<String>,
    pub category: Category,
    pub owner_id: Option<i64>,
    pub is_demo: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub original_file_path: String,
}

/// A feature marked on a dataset. Managed externally; carried here so
/// cascade-on-delete is guaranteed by the schema.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Annotation {
    pub id: i64,
    pub dataset_id: i64,
    pub user_id: String,
    pub geometry: Json<Value>,
    pub annotation_type: String,
    pub label: String,
    pub description: Option<String>,
    pub properties: Json<Value>,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Telemetry mirror of a dataset's ingestion run.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProcessingJob {
    pub id: i64,
    pub dataset_id: i64,
    pub task_id: String,
    pub status: ProcessingStatus,
    pub progress: f64,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Aggregated dataset statistics.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetStats {
    pub total_datasets: i64,
    pub earth: i64,
    pub mars: i64,
    pub space: i64,
    pub completed: i64,
    pub processing: i64,
    pub failed: i64,
    pub total_pixels: i64,
}

// =============================================================================
// Tests
// =============================================================================
