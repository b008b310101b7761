// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod config;
pub mod error;
pub mod history;
pub mod ingest;
pub mod limits;
pub mod metrics;
pub mod telemetry;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::error::{ErrorKind, FinalError, IngestError, ValidationError};
pub use crate::ingest::orchestrator::{IngestionOrchestrator, RunReport, RunStatus};
