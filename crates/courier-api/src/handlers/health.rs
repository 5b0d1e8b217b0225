//! Health check handlers for service monitoring.
//!
//! Provides liveness, readiness and detailed health endpoints. Only the
//! detailed and readiness checks touch storage; liveness answers as long as
//! the process serves HTTP.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use courier_core::{Clock, Storage};
use serde::Serialize;
use tracing::{debug, error, instrument};

use crate::state::AppState;

/// Health check response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall service health status
    pub status: HealthStatus,
    /// Timestamp when health check was performed
    pub timestamp: DateTime<Utc>,
    /// Individual component health checks
    pub checks: HealthChecks,
    /// Service version information
    pub version: String,
}

/// Overall health status enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Critical systems failing
    Unhealthy,
}

/// Individual component health check results.
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    /// Storage backend reachability
    pub storage: ComponentHealth,
}

/// Health status for individual components.
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    /// Component status
    pub status: ComponentStatus,
    /// Backend name, `memory` or `postgres`
    pub backend: &'static str,
    /// Error message if unhealthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Response time in milliseconds
    pub response_time_ms: u64,
}

/// Component-level health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is healthy
    Up,
    /// Component is experiencing issues
    Down,
}

/// Runs health checks against a clock, so timestamps are testable.
pub struct HealthService {
    clock: Arc<dyn Clock>,
}

impl HealthService {
    /// Creates a new health service with the given clock.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Performs every component check.
    pub async fn health_check(&self, storage: &Storage) -> HealthResponse {
        let timestamp = self.clock.now_utc();
        let started = self.clock.now();

        let (status, message) = match storage.health_check().await {
            Ok(()) => (ComponentStatus::Up, None),
            Err(e) => {
                error!(error = %e, "storage health check failed");
                (ComponentStatus::Down, Some(format!("storage unreachable: {e}")))
            },
        };
        let elapsed = self.clock.now().saturating_duration_since(started);

        let overall = match status {
            ComponentStatus::Up => HealthStatus::Healthy,
            ComponentStatus::Down => HealthStatus::Unhealthy,
        };

        HealthResponse {
            status: overall,
            timestamp,
            checks: HealthChecks {
                storage: ComponentHealth {
                    status,
                    backend: storage.backend_name(),
                    message,
                    response_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                },
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// `GET /health`
#[instrument(name = "health_check", skip_all)]
pub async fn health_check(State(state): State<AppState>) -> Response {
    let response = HealthService::new(state.clock.clone()).health_check(&state.storage).await;

    let status_code = match response.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    debug!(status = ?response.status, "health check completed");

    (status_code, Json(response)).into_response()
}

/// `GET /health/ready`
///
/// Ready once storage answers.
#[instrument(name = "readiness_check", skip_all)]
pub async fn readiness_check(State(state): State<AppState>) -> Response {
    match state.storage.health_check().await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"status": "ready"}))).into_response(),
        Err(e) => {
            debug!(error = %e, "not ready");
            (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({"status": "not_ready"})))
                .into_response()
        },
    }
}

/// `GET /health/live`
pub async fn liveness_check(State(state): State<AppState>) -> Response {
    let response = serde_json::json!({
        "status": "alive",
        "timestamp": state.clock.now_utc(),
        "service": "courier",
    });

    (StatusCode::OK, Json(response)).into_response()
}
