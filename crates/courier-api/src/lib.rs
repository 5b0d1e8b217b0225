//! Courier HTTP API.
//!
//! Event ingestion with idempotency and rate limiting, pull-based inbox
//! consumption, dead letter queue operations, replay, and a live event
//! stream, all behind API key authentication.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod ingest;
pub mod middleware;
pub mod server;
pub mod state;

pub use config::{Config, StorageBackend};
pub use error::ApiError;
pub use ingest::{IngestLimits, IngestionService};
pub use server::{create_router, shutdown_signal, start_server};
pub use state::{ApiSettings, AppState};
