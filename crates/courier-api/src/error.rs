//! API error type and its JSON representation.
//!
//! Every failure leaves the API as
//! `{"error": {"code": "...", "message": "..."}}` with a status code derived
//! from the error kind. Codes are stable and safe to match on; messages are
//! for humans.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use courier_core::{CoreError, RateLimitDecision};
use courier_delivery::{DlqError, ReplayError};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::{handlers::insert_rate_limit_headers, ingest::IngestError};

/// Errors returned by API handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing, unknown or revoked API key.
    #[error("{0}")]
    Unauthorized(String),

    /// The credential lacks the scope the route requires.
    #[error("API key lacks the {0} scope")]
    Forbidden(&'static str),

    /// The request is malformed or violates a limit.
    #[error("{message}")]
    Validation {
        /// What is wrong
        message: String,
        /// Offending field, when one can be named
        field: Option<String>,
    },

    /// The request body is larger than allowed.
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge {
        /// Byte limit that applied
        limit: usize,
    },

    /// A resource does not exist in the caller's account.
    #[error("{message}")]
    NotFound {
        /// Stable error code
        code: &'static str,
        /// What was not found
        message: String,
    },

    /// The request conflicts with current state.
    #[error("{message}")]
    Conflict {
        /// Stable error code
        code: &'static str,
        /// What conflicted
        message: String,
    },

    /// The credential's token bucket is empty.
    #[error("rate limit exceeded")]
    RateLimited(RateLimitDecision),

    /// Storage could not be reached.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Builds a validation error without a field.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into(), field: None }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::Validation { .. } => "validation_error",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::NotFound { code, .. } | Self::Conflict { code, .. } => code,
            Self::RateLimited(_) => "rate_limited",
            Self::Unavailable(_) => "storage_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    /// HTTP status for the error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Wire shape of an error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details
    pub error: ErrorDetail,
}

/// Code, message and optional field of an error.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Stable error code
    pub code: String,
    /// Human-readable description
    pub message: String,
    /// Offending request field
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::Internal(detail) => {
                error!(error = %detail, "request failed");
                "internal server error".to_string()
            },
            Self::Unavailable(detail) => {
                warn!(error = %detail, "storage unavailable");
                "storage is temporarily unavailable".to_string()
            },
            other => other.to_string(),
        };
        let field = match &self {
            Self::Validation { field, .. } => field.clone(),
            _ => None,
        };

        let body = ErrorResponse {
            error: ErrorDetail { code: self.code().to_string(), message, field },
        };
        let mut response = (status, Json(body)).into_response();

        if let Self::RateLimited(decision) = &self {
            insert_rate_limit_headers(response.headers_mut(), decision);
        }
        response
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Database(detail) => Self::Unavailable(detail),
            CoreError::NotFound(message) => Self::NotFound { code: "not_found", message },
            CoreError::Conflict(message) => Self::Conflict { code: "conflict", message },
            CoreError::InvalidInput(message) => Self::Validation { message, field: None },
            CoreError::LimitExceeded(message) => Self::Conflict { code: "limit_exceeded", message },
            CoreError::Serialization(detail) => Self::Internal(detail),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Validation { field, message } => {
                Self::Validation { message, field: Some(field.to_string()) }
            },
            IngestError::PayloadTooLarge { limit } => Self::PayloadTooLarge { limit },
            IngestError::RateLimited(decision) => Self::RateLimited(decision),
            err @ IngestError::IdempotencyConflict { .. } => {
                Self::Conflict { code: "idempotency_conflict", message: err.to_string() }
            },
            IngestError::Storage(err) => err.into(),
        }
    }
}

impl From<DlqError> for ApiError {
    fn from(err: DlqError) -> Self {
        match err {
            err @ DlqError::ItemNotFound { .. } => {
                Self::NotFound { code: "dlq_item_not_found", message: err.to_string() }
            },
            DlqError::InvalidInput(message) => Self::Validation { message, field: None },
            DlqError::Storage(err) => err.into(),
        }
    }
}

impl From<ReplayError> for ApiError {
    fn from(err: ReplayError) -> Self {
        match err {
            err @ ReplayError::EventNotFound(_) => {
                Self::NotFound { code: "event_not_found", message: err.to_string() }
            },
            err @ ReplayError::SubscriptionNotFound(_) => {
                Self::NotFound { code: "subscription_not_found", message: err.to_string() }
            },
            err @ ReplayError::NotReplayable(_) => {
                Self::Conflict { code: "event_not_replayable", message: err.to_string() }
            },
            err @ ReplayError::LimitExceeded { .. } => {
                Self::Conflict { code: "replay_limit_exceeded", message: err.to_string() }
            },
            ReplayError::Storage(err) => err.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use courier_core::EventId;

    use super::*;

    #[test]
    fn core_errors_keep_their_codes() {
        let cases = [
            (CoreError::Database("down".into()), StatusCode::SERVICE_UNAVAILABLE),
            (CoreError::NotFound("gone".into()), StatusCode::NOT_FOUND),
            (CoreError::InvalidInput("bad".into()), StatusCode::BAD_REQUEST),
            (CoreError::Serialization("corrupt".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (core, status) in cases {
            let code = core.code();
            let api = ApiError::from(core);
            assert_eq!(api.status(), status);
            assert_eq!(api.code(), code);
        }
    }

    #[test]
    fn replay_errors_map_to_conflicts_and_not_found() {
        let event_id = EventId::new();

        let limit = ApiError::from(ReplayError::LimitExceeded { event_id, cap: 3 });
        assert_eq!(limit.status(), StatusCode::CONFLICT);
        assert_eq!(limit.code(), "replay_limit_exceeded");

        let disabled = ApiError::from(ReplayError::NotReplayable(event_id));
        assert_eq!(disabled.code(), "event_not_replayable");

        let missing = ApiError::from(DlqError::ItemNotFound { event_id });
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(missing.code(), "dlq_item_not_found");
    }

    #[tokio::test]
    async fn internal_details_are_not_exposed() {
        let response = ApiError::Internal("pool exhausted at 10.0.0.3".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"error": {"code": "internal_error", "message": "internal server error"}})
        );
    }
}
