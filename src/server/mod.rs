//! HTTP server layer.
//!
//! Routes the external API onto the core operations:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        HTTP Layer                            │
//! │  /api/datasets/…  uploads + CRUD   (datasets.rs)             │
//! │  /api/tiles/…     tiles, batch, preview, info  (tiles.rs)    │
//! │  /health          liveness                                   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Authentication is upstream's concern; handlers only resolve an opaque
//! bearer credential to a user row and apply the access policy.

mod datasets;
mod routes;
mod state;
mod tiles;

pub use routes::create_router;
pub use state::{AppState, ErrorResponse, HealthResponse, MessageResponse};
