//! Metadata store.
//!
//! Persists the entities the pipeline works with (users, datasets,
//! annotations, processing jobs) in SQLite via sqlx, and exposes the typed
//! queries the rest of the system needs: lookups by id and name, filtered
//! listings, expiry scans and status aggregations.

mod models;
mod store;

pub use models::{
    Annotation, Category, Dataset, DatasetSeed, DatasetStats, ProcessingJob, ProcessingStatus,
    User,
};
pub use store::{DatasetFilter, MetadataStore};
