//! SQLite-backed metadata store.
//!
//! All writes the pipeline performs are single-row; cascade-delete of
//! annotations is enforced by the schema (`ON DELETE CASCADE` with foreign
//! keys switched on per connection).

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{QueryBuilder, Row, SqlitePool};

use crate::db::models::{
    Annotation, Category, Dataset, DatasetSeed, DatasetStats, ProcessingJob, ProcessingStatus,
    User,
};
use crate::error::DbError;

/// Pool sizing for burst traffic: 20 persistent connections plus overflow,
/// 30 s acquisition timeout, 1 h recycle.
const POOL_MIN_CONNECTIONS: u32 = 20;
const POOL_MAX_CONNECTIONS: u32 = 60;
const POOL_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_MAX_LIFETIME: Duration = Duration::from_secs(3600);

/// Filters for dataset listings.
#[derive(Debug, Clone, Default)]
pub struct DatasetFilter {
    /// Only rows owned by this user.
    pub owner_id: Option<i64>,
    /// Only demo rows.
    pub demo_only: bool,
    pub category: Option<Category>,
    pub status: Option<ProcessingStatus>,
    pub offset: i64,
    /// 0 means the default page size of 100.
    pub limit: i64,
}

/// Relational store for users, datasets, annotations and processing jobs.
#[derive(Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Open (or create) the database and prepare the connection pool.
    ///
    /// An in-memory database keeps a single connection, otherwise each pool
    /// connection would see its own empty store.
    pub async fn connect(database_url: &str) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // Recycling the single connection of an in-memory database would
        // drop the whole store, so lifetime limits only apply on disk.
        let in_memory = database_url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .min_connections(if in_memory { 1 } else { POOL_MIN_CONNECTIONS })
            .max_connections(if in_memory { 1 } else { POOL_MAX_CONNECTIONS })
            .acquire_timeout(POOL_ACQUIRE_TIMEOUT)
            .max_lifetime(if in_memory { None } else { Some(POOL_MAX_LIFETIME) })
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create tables and indexes if they do not exist.
    async fn init_schema(&self) -> Result<(), DbError> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL UNIQUE,
                username TEXT NOT NULL UNIQUE,
                credential_hash TEXT NOT NULL,
                full_name TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                is_superuser INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_login TEXT
            );

            CREATE TABLE IF NOT EXISTS datasets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                description TEXT,
                category TEXT NOT NULL,
                owner_id INTEGER REFERENCES users(id) ON DELETE CASCADE,
                is_demo INTEGER NOT NULL DEFAULT 0,
                expires_at TEXT,
                original_file_path TEXT NOT NULL,
                tile_base_path TEXT NOT NULL,
                width INTEGER NOT NULL DEFAULT 0,
                height INTEGER NOT NULL DEFAULT 0,
                tile_size INTEGER NOT NULL DEFAULT 256,
                min_zoom INTEGER NOT NULL DEFAULT 0,
                max_zoom INTEGER NOT NULL DEFAULT 0,
                projection TEXT,
                geotransform TEXT,
                bounds TEXT,
                extra_metadata TEXT NOT NULL DEFAULT '{}',
                processing_status TEXT NOT NULL DEFAULT 'pending',
                processing_progress INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_datasets_owner ON datasets(owner_id);
            CREATE INDEX IF NOT EXISTS idx_datasets_expires ON datasets(expires_at);
            CREATE INDEX IF NOT EXISTS idx_datasets_demo ON datasets(is_demo);

            CREATE TABLE IF NOT EXISTS annotations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                dataset_id INTEGER NOT NULL REFERENCES datasets(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL DEFAULT 'anonymous',
                geometry TEXT NOT NULL,
                annotation_type TEXT NOT NULL,
                label TEXT NOT NULL,
                description TEXT,
                properties TEXT NOT NULL DEFAULT '{}',
                confidence REAL NOT NULL DEFAULT 1.0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_annotations_dataset ON annotations(dataset_id);

            CREATE TABLE IF NOT EXISTS processing_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                dataset_id INTEGER NOT NULL REFERENCES datasets(id) ON DELETE CASCADE,
                task_id TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'pending',
                progress REAL NOT NULL DEFAULT 0.0,
                error_message TEXT,
                started_at TEXT,
                completed_at TEXT,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Access the underlying pool (integration test fixtures).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // =========================================================================
    // Users
    // =========================================================================

    pub async fn insert_user(
        &self,
        email: &str,
        username: &str,
        credential_hash: &str,
        full_name: Option<&str>,
        is_superuser: bool,
    ) -> Result<User, DbError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO users (email, username, credential_hash, full_name, is_active, is_superuser, created_at)
             VALUES (?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(email.to_lowercase())
        .bind(username.to_lowercase())
        .bind(credential_hash)
        .bind(full_name)
        .bind(is_superuser)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_user(result.last_insert_rowid()).await
    }

    pub async fn get_user(&self, id: i64) -> Result<User, DbError> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DbError::NotFound { entity: "user", id })
    }

    /// Resolve an opaque credential to its user row.
    pub async fn find_user_by_credential(
        &self,
        credential: &str,
    ) -> Result<Option<User>, DbError> {
        Ok(
            sqlx::query_as::<_, User>("SELECT * FROM users WHERE credential_hash = ?")
                .bind(credential)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    // =========================================================================
    // Datasets
    // =========================================================================

    /// Insert a new dataset row in `pending` state and return it.
    pub async fn insert_dataset(&self, seed: &DatasetSeed) -> Result<Dataset, DbError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO datasets
                (name, description, category, owner_id, is_demo, expires_at,
                 original_file_path, tile_base_path, extra_metadata,
                 processing_status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, '', '{}', 'pending', ?, ?)",
        )
        .bind(&seed.name)
        .bind(&seed.description)
        .bind(seed.category)
        .bind(seed.owner_id)
        .bind(seed.is_demo)
        .bind(seed.expires_at)
        .bind(&seed.original_file_path)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db) = &e {
                if db.is_unique_violation() {
                    return DbError::DuplicateName(seed.name.clone());
                }
            }
            DbError::Sqlx(e)
        })?;

        self.get_dataset(result.last_insert_rowid()).await
    }

    /// Insert a full dataset row with an explicit id (startup reconciliation
    /// of demo datasets persisted to the object store).
    pub async fn insert_dataset_row(&self, dataset: &Dataset) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO datasets
                (id, name, description, category, owner_id, is_demo, expires_at,
                 original_file_path, tile_base_path, width, height, tile_size,
                 min_zoom, max_zoom, projection, geotransform, bounds,
                 extra_metadata, processing_status, processing_progress,
                 created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(dataset.id)
        .bind(&dataset.name)
        .bind(&dataset.description)
        .bind(dataset.category)
        .bind(dataset.owner_id)
        .bind(dataset.is_demo)
        .bind(dataset.expires_at)
        .bind(&dataset.original_file_path)
        .bind(&dataset.tile_base_path)
        .bind(dataset.width)
        .bind(dataset.height)
        .bind(dataset.tile_size)
        .bind(dataset.min_zoom)
        .bind(dataset.max_zoom)
        .bind(&dataset.projection)
        .bind(&dataset.geotransform)
        .bind(&dataset.bounds)
        .bind(&dataset.extra_metadata)
        .bind(dataset.processing_status)
        .bind(dataset.processing_progress)
        .bind(dataset.created_at)
        .bind(dataset.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_dataset(&self, id: i64) -> Result<Dataset, DbError> {
        sqlx::query_as::<_, Dataset>("SELECT * FROM datasets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DbError::NotFound {
                entity: "dataset",
                id,
            })
    }

    pub async fn find_dataset_by_name(&self, name: &str) -> Result<Option<Dataset>, DbError> {
        Ok(
            sqlx::query_as::<_, Dataset>("SELECT * FROM datasets WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// List datasets newest first with the given filters.
    pub async fn list_datasets(&self, filter: &DatasetFilter) -> Result<Vec<Dataset>, DbError> {
        let mut builder = QueryBuilder::new("SELECT * FROM datasets WHERE 1=1");

        if let Some(owner_id) = filter.owner_id {
            builder.push(" AND owner_id = ").push_bind(owner_id);
        }
        if filter.demo_only {
            builder.push(" AND is_demo = 1");
        }
        if let Some(category) = filter.category {
            builder.push(" AND category = ").push_bind(category);
        }
        if let Some(status) = filter.status {
            builder.push(" AND processing_status = ").push_bind(status);
        }

        let limit = if filter.limit > 0 { filter.limit } else { 100 };
        builder
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(filter.offset.max(0));

        Ok(builder
            .build_query_as::<Dataset>()
            .fetch_all(&self.pool)
            .await?)
    }

    /// Non-demo datasets whose expiry has passed.
    pub async fn expired_datasets(&self, now: DateTime<Utc>) -> Result<Vec<Dataset>, DbError> {
        Ok(sqlx::query_as::<_, Dataset>(
            "SELECT * FROM datasets
             WHERE is_demo = 0 AND expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Datasets stuck in `processing` (abandoned by a previous process).
    pub async fn processing_datasets(&self) -> Result<Vec<Dataset>, DbError> {
        Ok(sqlx::query_as::<_, Dataset>(
            "SELECT * FROM datasets WHERE processing_status = 'processing'",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Full-row update. Bumps `updated_at`.
    pub async fn update_dataset(&self, dataset: &Dataset) -> Result<(), DbError> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE datasets SET
                name = ?, description = ?, category = ?, owner_id = ?, is_demo = ?,
                expires_at = ?, original_file_path = ?, tile_base_path = ?,
                width = ?, height = ?, tile_size = ?, min_zoom = ?, max_zoom = ?,
                projection = ?, geotransform = ?, bounds = ?, extra_metadata = ?,
                processing_status = ?, processing_progress = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&dataset.name)
        .bind(&dataset.description)
        .bind(dataset.category)
        .bind(dataset.owner_id)
        .bind(dataset.is_demo)
        .bind(dataset.expires_at)
        .bind(&dataset.original_file_path)
        .bind(&dataset.tile_base_path)
        .bind(dataset.width)
        .bind(dataset.height)
        .bind(dataset.tile_size)
        .bind(dataset.min_zoom)
        .bind(dataset.max_zoom)
        .bind(&dataset.projection)
        .bind(&dataset.geotransform)
        .bind(&dataset.bounds)
        .bind(&dataset.extra_metadata)
        .bind(dataset.processing_status)
        .bind(dataset.processing_progress)
        .bind(now)
        .bind(dataset.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Single-row status transition.
    pub async fn set_status(
        &self,
        id: i64,
        status: ProcessingStatus,
        progress: i64,
    ) -> Result<(), DbError> {
        sqlx::query(
            "UPDATE datasets SET processing_status = ?, processing_progress = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(status)
        .bind(progress)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Single-row progress write (the only cross-thread state update an
    /// ingestion job performs).
    pub async fn set_progress(&self, id: i64, progress: i64) -> Result<(), DbError> {
        sqlx::query("UPDATE datasets SET processing_progress = ?, updated_at = ? WHERE id = ?")
            .bind(progress)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Merge keys into `extra_metadata` (read-modify-write on a single row).
    pub async fn merge_extra_metadata(&self, id: i64, patch: Value) -> Result<(), DbError> {
        let dataset = self.get_dataset(id).await?;
        let mut extra = dataset.extra_metadata.0;
        if let (Some(obj), Some(patch_obj)) = (extra.as_object_mut(), patch.as_object()) {
            for (k, v) in patch_obj {
                obj.insert(k.clone(), v.clone());
            }
        }
        sqlx::query("UPDATE datasets SET extra_metadata = ?, updated_at = ? WHERE id = ?")
            .bind(Json(extra))
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete the row (annotations cascade). Idempotent.
    pub async fn delete_dataset(&self, id: i64) -> Result<(), DbError> {
        sqlx::query("DELETE FROM datasets WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn dataset_stats(&self) -> Result<DatasetStats, DbError> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) AS total,
                SUM(category = 'earth') AS earth,
                SUM(category = 'mars') AS mars,
                SUM(category = 'space') AS space,
                SUM(processing_status = 'completed') AS completed,
                SUM(processing_status = 'processing') AS processing,
                SUM(processing_status = 'failed') AS failed,
                COALESCE(SUM(width * height), 0) AS total_pixels
             FROM datasets",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(DatasetStats {
            total_datasets: row.try_get::<i64, _>("total")?,
            earth: row.try_get::<Option<i64>, _>("earth")?.unwrap_or(0),
            mars: row.try_get::<Option<i64>, _>("mars")?.unwrap_or(0),
            space: row.try_get::<Option<i64>, _>("space")?.unwrap_or(0),
            completed: row.try_get::<Option<i64>, _>("completed")?.unwrap_or(0),
            processing: row.try_get::<Option<i64>, _>("processing")?.unwrap_or(0),
            failed: row.try_get::<Option<i64>, _>("failed")?.unwrap_or(0),
            total_pixels: row.try_get::<i64, _>("total_pixels")?,
        })
    }

    // =========================================================================
    // Annotations (cascade guarantee only; CRUD is external)
    // =========================================================================

    pub async fn insert_annotation(
        &self,
        dataset_id: i64,
        user_id: &str,
        geometry: Value,
        annotation_type: &str,
        label: &str,
    ) -> Result<Annotation, DbError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO annotations
                (dataset_id, user_id, geometry, annotation_type, label, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(dataset_id)
        .bind(user_id)
        .bind(Json(geometry))
        .bind(annotation_type)
        .bind(label)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        Ok(
            sqlx::query_as::<_, Annotation>("SELECT * FROM annotations WHERE id = ?")
                .bind(id)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    pub async fn count_annotations(&self, dataset_id: i64) -> Result<i64, DbError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM annotations WHERE dataset_id = ?")
            .bind(dataset_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    // =========================================================================
    // Processing jobs (telemetry mirror)
    // =========================================================================

    pub async fn insert_job(&self, dataset_id: i64, task_id: &str) -> Result<(), DbError> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO processing_jobs (dataset_id, task_id, status, started_at, created_at)
             VALUES (?, ?, 'processing', ?, ?)",
        )
        .bind(dataset_id)
        .bind(task_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn complete_job(
        &self,
        task_id: &str,
        status: ProcessingStatus,
        error_message: Option<&str>,
    ) -> Result<(), DbError> {
        let progress = if status == ProcessingStatus::Completed {
            100.0
        } else {
            0.0
        };
        sqlx::query(
            "UPDATE processing_jobs
             SET status = ?, progress = ?, error_message = ?, completed_at = ?
             WHERE task_id = ?",
        )
        .bind(status)
        .bind(progress)
        .bind(error_message)
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_job(&self, task_id: &str) -> Result<Option<ProcessingJob>, DbError> {
        Ok(
            sqlx::query_as::<_, ProcessingJob>("SELECT * FROM processing_jobs WHERE task_id = ?")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
