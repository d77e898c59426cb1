//! Ingestion orchestration.
//!
//! [`DatasetProcessor`] drives a dataset through its lifecycle:
//!
//! ```text
//! create_entry          spawn_tile_job
//!     │                      │
//!     ▼                      ▼
//! [pending] ──────────▶ [processing] ──progress──▶ ...
//!                        │        │
//!                success │        │ fatal
//!                        ▼        ▼
//!                  [completed]  [failed]
//!                        │
//!          expires_at reached (user datasets)
//!                        ▼
//!                    [deleted]
//! ```
//!
//! [`LifecycleManager`] is the periodic sweeper deleting expired user
//! datasets and reconciling object-store-persisted demo datasets into the
//! database at startup.

mod lifecycle;
#[allow(clippy::module_inception)]
mod processor;

pub use lifecycle::LifecycleManager;
pub use processor::{DatasetPatch, DatasetProcessor};
