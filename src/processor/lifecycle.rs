//! Lifecycle management: expiry sweeps and startup reconciliation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::db::{Dataset, MetadataStore};
use crate::error::{ApiError, DbError};
use crate::identity::Caller;
use crate::processor::DatasetProcessor;
use crate::store::{metadata_prefix, ObjectStore};

/// Back off this long after a failed sweep.
const ERROR_BACKOFF: Duration = Duration::from_secs(300);

/// Background sweeper for expired user datasets plus the startup
/// reconciliation that makes demo datasets durable across ephemeral hosts.
pub struct LifecycleManager {
    processor: Arc<DatasetProcessor>,
    db: MetadataStore,
    store: ObjectStore,
    interval: Duration,
}

impl LifecycleManager {
    pub fn new(
        processor: Arc<DatasetProcessor>,
        db: MetadataStore,
        store: ObjectStore,
        interval: Duration,
    ) -> Self {
        Self {
            processor,
            db,
            store,
            interval,
        }
    }

    /// Run the sweep loop forever. Sweep failures back off five minutes
    /// instead of the full interval.
    pub async fn run(self: Arc<Self>) {
        info!(interval_secs = self.interval.as_secs(), "cleanup scheduler started");
        loop {
            match self.sweep().await {
                Ok(deleted) => {
                    if deleted > 0 {
                        info!(deleted, "cleanup pass removed expired datasets");
                    }
                    tokio::time::sleep(self.interval).await;
                }
                Err(e) => {
                    error!(error = %e, "cleanup pass failed");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// One pass: delete every expired user dataset. Per-dataset failures
    /// are logged and the pass continues.
    pub async fn sweep(&self) -> Result<usize, ApiError> {
        let due = self.db.expired_datasets(Utc::now()).await?;
        if due.is_empty() {
            return Ok(0);
        }
        info!(count = due.len(), "expired datasets due for cleanup");

        let mut deleted = 0usize;
        for dataset in due {
            match self.processor.delete(dataset.id, &Caller::System).await {
                Ok(()) => {
                    deleted += 1;
                    info!(dataset_id = dataset.id, name = %dataset.name, "expired dataset deleted");
                }
                Err(e) => {
                    warn!(dataset_id = dataset.id, error = %e, "failed to delete expired dataset");
                }
            }
        }
        Ok(deleted)
    }

    /// Startup reconciliation: insert demo datasets persisted to the
    /// object store that are missing from the database.
    ///
    /// Also logs datasets abandoned mid-`processing` by a previous process;
    /// they are not auto-resumed, operators reprocess explicitly.
    pub async fn reconcile_startup(&self) -> Result<usize, ApiError> {
        let abandoned = self.db.processing_datasets().await?;
        for dataset in &abandoned {
            warn!(
                dataset_id = dataset.id,
                name = %dataset.name,
                "dataset stuck in processing from a previous run; reprocess to resume"
            );
        }

        if !self.store.enabled() {
            return Ok(0);
        }

        let documents: Vec<Dataset> = self.store.list_json(metadata_prefix()).await?;
        let mut inserted = 0usize;

        for document in documents {
            match self.db.get_dataset(document.id).await {
                Ok(_) => continue,
                Err(DbError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }

            // Persisted documents are demo rows by definition; normalize
            // the invariants regardless of what the document says.
            let mut dataset = document;
            dataset.is_demo = true;
            dataset.owner_id = None;
            dataset.expires_at = None;

            match self.db.insert_dataset_row(&dataset).await {
                Ok(()) => {
                    inserted += 1;
                    info!(dataset_id = dataset.id, name = %dataset.name, "restored demo dataset");
                }
                Err(e) => {
                    warn!(dataset_id = dataset.id, error = %e, "failed to restore demo dataset");
                }
            }
        }

        Ok(inserted)
    }
}

// =============================================================================
// Tests
// =============================================================================
