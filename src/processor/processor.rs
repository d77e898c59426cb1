//! Dataset processor: ingestion jobs, replication and dataset operations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use futures::StreamExt;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::TileCache;
use crate::config::Config;
use crate::db::{Category, Dataset, DatasetFilter, DatasetSeed, MetadataStore, ProcessingStatus};
use crate::error::{ApiError, DbError, StoreError, TileError};
use crate::identity::{check_access, Caller, Intent, UserIdentity};
use crate::raster;
use crate::store::{dataset_metadata_key, preview_key, tiles_prefix, ObjectStore};
use crate::sys;
use crate::tiles::TileGenerator;

/// User uploads live for 24 hours.
const USER_DATASET_TTL_HOURS: i64 = 24;

/// Fields a dataset update may patch.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct DatasetPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub category: Option<Category>,
}

/// Orchestrates dataset ingestion and management.
pub struct DatasetProcessor {
    db: MetadataStore,
    store: ObjectStore,
    cache: Arc<TileCache>,
    config: Arc<Config>,
}

impl DatasetProcessor {
    pub fn new(
        db: MetadataStore,
        store: ObjectStore,
        cache: Arc<TileCache>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            store,
            cache,
            config,
        }
    }

    pub fn db(&self) -> &MetadataStore {
        &self.db
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// Create the dataset row for an uploaded file: validate the unique
    /// name, extract source metadata, persist with status `pending`.
    ///
    /// Tile generation is a separate step ([`Self::spawn_tile_job`]).
    pub async fn create_entry(
        &self,
        file_path: &Path,
        name: &str,
        description: Option<String>,
        category: Category,
        owner: Option<&UserIdentity>,
        is_demo: bool,
    ) -> Result<Dataset, ApiError> {
        if self.db.find_dataset_by_name(name).await.map_err(ApiError::from)?.is_some() {
            return Err(DbError::DuplicateName(name.to_string()).into());
        }

        // Probing validates the file before any row exists.
        let probe_path = file_path.to_path_buf();
        let metadata = tokio::task::spawn_blocking(move || raster::probe_metadata(&probe_path))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))??;

        let expires_at = if owner.is_some() && !is_demo {
            Some(Utc::now() + ChronoDuration::hours(USER_DATASET_TTL_HOURS))
        } else {
            None
        };

        let seed = DatasetSeed {
            name: name.to_string(),
            description,
            category,
            owner_id: owner.map(|o| o.id),
            is_demo,
            expires_at,
            original_file_path: file_path.to_string_lossy().into_owned(),
        };
        let mut dataset = self.db.insert_dataset(&seed).await?;

        let max_zoom = crate::tiles::max_zoom_for(
            metadata.width,
            metadata.height,
            self.config.tile_size,
            self.config.max_zoom_cap,
        );

        dataset.tile_base_path = self
            .tile_base_dir(dataset.id)
            .to_string_lossy()
            .into_owned();
        dataset.width = metadata.width as i64;
        dataset.height = metadata.height as i64;
        dataset.tile_size = self.config.tile_size as i64;
        dataset.min_zoom = 0;
        dataset.max_zoom = max_zoom as i64;
        dataset.projection = metadata.projection;
        dataset.geotransform = metadata.geotransform.map(sqlx::types::Json);
        dataset.bounds = metadata.bounds.map(sqlx::types::Json);
        self.db.update_dataset(&dataset).await?;

        info!(
            dataset_id = dataset.id,
            name,
            width = dataset.width,
            height = dataset.height,
            max_zoom,
            "dataset entry created"
        );
        self.db.get_dataset(dataset.id).await.map_err(ApiError::from)
    }

    /// Spawn the ingestion job for a dataset. Returns the task id.
    ///
    /// The job survives the request that created it; the dataset row is the
    /// single source of truth for its progress.
    pub fn spawn_tile_job(self: &Arc<Self>, dataset_id: i64, file_path: PathBuf) -> String {
        let task_id = Uuid::new_v4().to_string();
        let processor = Arc::clone(self);
        let spawned_task = task_id.clone();

        tokio::spawn(async move {
            if let Err(e) = processor
                .run_tile_job(dataset_id, &file_path, &spawned_task)
                .await
            {
                error!(dataset_id, error = %e, "tile job failed");
            }
        });

        task_id
    }

    /// Run one ingestion job to completion.
    ///
    /// Long-running; never propagates into a request handler. Failures are
    /// written into the dataset row (`failed` + `extra_metadata.error`).
    pub async fn run_tile_job(
        &self,
        dataset_id: i64,
        file_path: &Path,
        task_id: &str,
    ) -> Result<(), ApiError> {
        // Validate the row exists before any state transition.
        self.db.get_dataset(dataset_id).await?;
        self.db.insert_job(dataset_id, task_id).await?;

        // Disk pre-check: the PNG tree is roughly the size of the source.
        let filesize = tokio::fs::metadata(file_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let available = sys::available_disk_space(&self.config.tiles_dir);
        if available < filesize {
            let err = TileError::InsufficientDisk {
                needed: filesize,
                available,
            };
            self.fail_job(dataset_id, task_id, &err).await;
            return Ok(());
        }

        self.db
            .set_status(dataset_id, ProcessingStatus::Processing, 0)
            .await?;

        // Bridge blocking generation to single-row progress writes. The
        // callback only stores into the watch channel, so it never blocks
        // the generation loop.
        let (progress_tx, mut progress_rx) = tokio::sync::watch::channel(0u8);
        let progress_db = self.db.clone();
        let progress_task = tokio::spawn(async move {
            while progress_rx.changed().await.is_ok() {
                let percent = *progress_rx.borrow();
                if let Err(e) = progress_db.set_progress(dataset_id, percent as i64).await {
                    warn!(dataset_id, error = %e, "progress write failed");
                }
            }
        });

        let generator = TileGenerator::new(
            file_path.to_path_buf(),
            self.tile_base_dir(dataset_id),
            self.config.tile_size,
            self.config.max_zoom_cap,
        );
        let result = tokio::task::spawn_blocking(move || {
            let report = generator.generate(&move |p| {
                let _ = progress_tx.send(p);
            });
            (generator, report)
        })
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
        progress_task.abort();

        let (generator, report) = result;
        let report = match report {
            Ok(report) => report,
            Err(e) => {
                self.fail_job(dataset_id, task_id, &e).await;
                return Ok(());
            }
        };

        // Completed as soon as the local tree exists, so tile serving
        // unblocks without waiting for replication.
        self.db
            .set_status(dataset_id, ProcessingStatus::Completed, 100)
            .await?;
        self.db
            .complete_job(task_id, ProcessingStatus::Completed, None)
            .await?;
        if report.corrupted_tiles > 0 {
            self.db
                .merge_extra_metadata(
                    dataset_id,
                    json!({ "corrupted_tiles": report.corrupted_tiles }),
                )
                .await?;
        }
        info!(
            dataset_id,
            tiles = report.tiles_generated,
            corrupted = report.corrupted_tiles,
            "dataset processing completed"
        );

        // Preview is best-effort.
        let preview_path = self.preview_path(dataset_id);
        let preview_result =
            tokio::task::spawn_blocking(move || generator.generate_preview(&preview_path)).await;
        match preview_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(dataset_id, error = %e, "preview generation failed"),
            Err(e) => warn!(dataset_id, error = %e, "preview task panicked"),
        }

        if self.store.enabled() {
            if let Err(e) = self.replicate_to_store(dataset_id).await {
                warn!(dataset_id, error = %e, "replication failed, dataset stays local-only");
                self.db
                    .merge_extra_metadata(dataset_id, json!({ "r2_upload_error": e.to_string() }))
                    .await?;
            }
        }

        Ok(())
    }

    /// Record a failed job on the dataset row.
    async fn fail_job(&self, dataset_id: i64, task_id: &str, err: &TileError) {
        error!(dataset_id, error = %err, "ingestion job failed");
        if let Err(e) = self
            .db
            .set_status(dataset_id, ProcessingStatus::Failed, 0)
            .await
        {
            error!(dataset_id, error = %e, "failed to record job failure");
        }
        let _ = self
            .db
            .merge_extra_metadata(dataset_id, json!({ "error": err.failure_token() }))
            .await;
        let _ = self
            .db
            .complete_job(task_id, ProcessingStatus::Failed, Some(&err.to_string()))
            .await;
    }

    /// Upload the tile tree, preview and (for demo datasets) the metadata
    /// document to the object store through a bounded worker pool.
    async fn replicate_to_store(&self, dataset_id: i64) -> Result<(), StoreError> {
        let tile_dir = self.tile_base_dir(dataset_id);
        let files = {
            let dir = tile_dir.clone();
            tokio::task::spawn_blocking(move || collect_tile_files(&dir))
                .await
                .unwrap_or_default()
        };
        let total = files.len();

        let uploads = futures::stream::iter(files.into_iter().map(|(path, rel)| {
            let store = self.store.clone();
            let key = format!("{}{}", tiles_prefix(dataset_id), rel);
            let content_type = content_type_for(&rel);
            async move { store.put_file(&path, &key, content_type).await.is_ok() }
        }))
        .buffer_unordered(self.config.upload_workers)
        .collect::<Vec<bool>>()
        .await;

        let uploaded = uploads.iter().filter(|ok| **ok).count();
        let failed = total - uploaded;
        info!(dataset_id, uploaded, failed, "tile replication finished");

        if failed > 0 {
            return Err(StoreError::S3(format!(
                "{} of {} tile uploads failed",
                failed, total
            )));
        }

        self.db
            .merge_extra_metadata(
                dataset_id,
                json!({ "tiles_uploaded_to_cloud": true, "tiles_count": uploaded }),
            )
            .await
            .map_err(|e| StoreError::S3(e.to_string()))?;

        // Preview upload is best-effort like its generation.
        let preview = self.preview_path(dataset_id);
        if preview.exists() {
            let key = preview_key(dataset_id);
            if self.store.put_file(&preview, &key, "image/jpeg").await.is_ok() {
                if let Some(url) = self.store.public_url(&key) {
                    let _ = self
                        .db
                        .merge_extra_metadata(dataset_id, json!({ "preview_url": url }))
                        .await;
                }
            }
        }

        // Demo datasets persist their row so ephemeral hosts can rebuild it.
        if let Ok(dataset) = self.db.get_dataset(dataset_id).await {
            if dataset.is_demo {
                self.store
                    .put_json(&dataset_metadata_key(dataset_id), &dataset)
                    .await?;
            }
        }

        Ok(())
    }

    /// Delete a dataset: local artifacts, object store artifacts, then the
    /// row (annotations cascade). Artifact removal is best-effort; the row
    /// goes last. Idempotent: a second call finds nothing.
    pub async fn delete(&self, dataset_id: i64, caller: &Caller) -> Result<(), ApiError> {
        let dataset = self.db.get_dataset(dataset_id).await?;
        check_access(&dataset, caller, Intent::Delete)?;

        let tile_dir = self.tile_base_dir(dataset_id);
        if let Err(e) = tokio::fs::remove_dir_all(&tile_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dataset_id, error = %e, "failed to remove tile directory");
            }
        }
        remove_file_best_effort(Path::new(&dataset.original_file_path)).await;
        remove_file_best_effort(&self.preview_path(dataset_id)).await;

        if self.store.enabled() {
            if let Err(e) = self.store.delete_prefix(&tiles_prefix(dataset_id)).await {
                warn!(dataset_id, error = %e, "failed to delete tile prefix");
            }
            if let Err(e) = self.store.delete(&preview_key(dataset_id)).await {
                warn!(dataset_id, error = %e, "failed to delete preview object");
            }
            if let Err(e) = self.store.delete(&dataset_metadata_key(dataset_id)).await {
                warn!(dataset_id, error = %e, "failed to delete metadata document");
            }
        }

        self.cache.clear(Some(dataset_id)).await;
        self.db.delete_dataset(dataset_id).await?;
        info!(dataset_id, "dataset deleted");
        Ok(())
    }

    /// Drop the local tile tree and rerun the ingestion job.
    pub async fn reprocess(
        self: &Arc<Self>,
        dataset_id: i64,
        caller: &Caller,
    ) -> Result<String, ApiError> {
        let dataset = self.db.get_dataset(dataset_id).await?;
        check_access(&dataset, caller, Intent::Modify)?;

        let original = PathBuf::from(&dataset.original_file_path);
        if !original.exists() {
            return Err(ApiError::BadRequest(format!(
                "original file not found: {}",
                original.display()
            )));
        }

        let tile_dir = self.tile_base_dir(dataset_id);
        if let Err(e) = tokio::fs::remove_dir_all(&tile_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(ApiError::Internal(e.to_string()));
            }
        }
        self.cache.clear(Some(dataset_id)).await;

        Ok(self.spawn_tile_job(dataset_id, original))
    }

    /// List datasets with the visibility rule: users see their own rows,
    /// anonymous callers see demo rows, the system sees everything.
    pub async fn list(
        &self,
        caller: &Caller,
        category: Option<Category>,
        status: Option<ProcessingStatus>,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Dataset>, ApiError> {
        let mut filter = DatasetFilter {
            category,
            status,
            offset,
            limit,
            ..Default::default()
        };
        match caller {
            Caller::User(identity) => filter.owner_id = Some(identity.id),
            Caller::Anonymous => filter.demo_only = true,
            Caller::System => {}
        }
        Ok(self.db.list_datasets(&filter).await?)
    }

    pub async fn get(&self, dataset_id: i64, caller: &Caller) -> Result<Dataset, ApiError> {
        let dataset = self.db.get_dataset(dataset_id).await?;
        check_access(&dataset, caller, Intent::Read)?;
        Ok(dataset)
    }

    /// Patch mutable metadata. Demo datasets are immutable.
    pub async fn update(
        &self,
        dataset_id: i64,
        patch: DatasetPatch,
        caller: &Caller,
    ) -> Result<Dataset, ApiError> {
        let mut dataset = self.db.get_dataset(dataset_id).await?;
        check_access(&dataset, caller, Intent::Modify)?;

        if let Some(name) = patch.name {
            if name != dataset.name {
                if self.db.find_dataset_by_name(&name).await?.is_some() {
                    return Err(DbError::DuplicateName(name).into());
                }
                dataset.name = name;
            }
        }
        if let Some(description) = patch.description {
            dataset.description = Some(description);
        }
        if let Some(category) = patch.category {
            dataset.category = category;
        }

        self.db.update_dataset(&dataset).await?;
        Ok(self.db.get_dataset(dataset_id).await?)
    }

    pub fn tile_base_dir(&self, dataset_id: i64) -> PathBuf {
        self.config.tiles_dir.join(dataset_id.to_string())
    }

    pub fn preview_path(&self, dataset_id: i64) -> PathBuf {
        self.config
            .datasets_dir
            .join(format!("{}_preview.jpg", dataset_id))
    }
}

/// Walk a tile tree, returning `(absolute path, z/x/y.ext)` pairs.
fn collect_tile_files(dir: &Path) -> Vec<(PathBuf, String)> {
    fn walk(base: &Path, dir: &Path, out: &mut Vec<(PathBuf, String)>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(base, &path, out);
            } else if let Ok(rel) = path.strip_prefix(base) {
                let rel = rel.to_string_lossy().replace('\\', "/");
                out.push((path.clone(), rel));
            }
        }
    }

    let mut files = Vec::new();
    walk(dir, dir, &mut files);
    files.sort_by(|a, b| a.1.cmp(&b.1));
    files
}

fn content_type_for(rel_path: &str) -> &'static str {
    match rel_path.rsplit_once('.').map(|(_, ext)| ext) {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

async fn remove_file_best_effort(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove file");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
