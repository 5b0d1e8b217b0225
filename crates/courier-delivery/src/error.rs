//! Error types for webhook delivery operations.
//!
//! HTTP outcomes are categorized so the worker can decide between another
//! attempt and the dead letter queue, and so each failure can be recorded
//! with the right attempt outcome.

use std::{fmt, time::Duration};

use courier_core::{AttemptOutcome, CoreError};
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error conditions of a delivery attempt and the machinery around it.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Connection could not be established or was reset.
    #[error("network connection failed: {message}")]
    Network {
        /// Transport error description
        message: String,
    },

    /// No response within the subscription timeout.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Timeout that elapsed
        timeout_seconds: u64,
    },

    /// Subscriber answered with a 4xx other than 429.
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code
        status_code: u16,
        /// Truncated response body
        body: String,
    },

    /// Subscriber answered with a 5xx or another non-2xx status.
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code
        status_code: u16,
        /// Truncated response body
        body: String,
    },

    /// Subscriber answered 429.
    #[error("rate limited: HTTP 429")]
    RateLimited {
        /// Parsed `Retry-After`, if the subscriber sent one
        retry_after_seconds: Option<u64>,
        /// Truncated response body
        body: String,
    },

    /// Storage failed while recording delivery state.
    #[error("storage error: {message}")]
    Storage {
        /// Storage error message
        message: String,
    },

    /// The request could not be built from the subscription.
    #[error("invalid subscription configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    Internal {
        /// Internal error message
        message: String,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Worker that panicked
        worker_id: usize,
        /// Join error description
        error: String,
    },

    /// Workers did not stop within the shutdown timeout.
    #[error("worker shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that elapsed
        timeout: Duration,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates the error for a non-2xx response.
    pub fn from_status(
        status_code: u16,
        body: impl Into<String>,
        retry_after_seconds: Option<u64>,
    ) -> Self {
        let body = body.into();
        match status_code {
            429 => Self::RateLimited { retry_after_seconds, body },
            400..=499 => Self::ClientError { status_code, body },
            _ => Self::ServerError { status_code, body },
        }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Returns whether another attempt may succeed.
    ///
    /// Every HTTP outcome counts as transient, 4xx included: subscribers
    /// fix their endpoints, and the retry budget bounds the cost. Requests
    /// that cannot even be built are not retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::ClientError { .. }
            | Self::ServerError { .. }
            | Self::RateLimited { .. }
            | Self::Storage { .. } => true,

            Self::Configuration { .. }
            | Self::Internal { .. }
            | Self::WorkerPanic { .. }
            | Self::ShutdownTimeout { .. } => false,
        }
    }

    /// Returns the subscriber's `Retry-After` hint in seconds.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_seconds, .. } => *retry_after_seconds,
            _ => None,
        }
    }

    /// Returns the HTTP status the subscriber answered with, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ClientError { status_code, .. } | Self::ServerError { status_code, .. } => {
                Some(*status_code)
            },
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Returns the subscriber's response body, if one was received.
    pub fn response_body(&self) -> Option<&str> {
        match self {
            Self::ClientError { body, .. }
            | Self::ServerError { body, .. }
            | Self::RateLimited { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Classifies the error for the attempt record.
    pub fn attempt_outcome(&self) -> AttemptOutcome {
        match self {
            Self::Network { .. } => AttemptOutcome::ConnectionError,
            Self::Timeout { .. } => AttemptOutcome::Timeout,
            Self::ClientError { .. } | Self::ServerError { .. } | Self::RateLimited { .. } => {
                AttemptOutcome::HttpError
            },
            _ => AttemptOutcome::UnknownError,
        }
    }

    /// Returns the category for logs and stats.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from(self)
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        Self::storage(err.to_string())
    }
}

/// Category of delivery error for logs and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network connectivity issues and timeouts.
    Network,
    /// HTTP client errors (4xx).
    Client,
    /// HTTP server errors (5xx).
    Server,
    /// Rate limiting.
    RateLimit,
    /// Storage operations.
    Storage,
    /// Configuration problems.
    Configuration,
    /// Internal system errors.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::Network { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::ClientError { .. } => Self::Client,
            DeliveryError::ServerError { .. } => Self::Server,
            DeliveryError::RateLimited { .. } => Self::RateLimit,
            DeliveryError::Storage { .. } => Self::Storage,
            DeliveryError::Configuration { .. } => Self::Configuration,
            DeliveryError::Internal { .. }
            | DeliveryError::WorkerPanic { .. }
            | DeliveryError::ShutdownTimeout { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Storage => write!(f, "storage"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_and_transport_failures_are_retryable() {
        assert!(DeliveryError::network("connection refused").is_retryable());
        assert!(DeliveryError::timeout(30).is_retryable());
        assert!(DeliveryError::from_status(500, "boom", None).is_retryable());
        assert!(DeliveryError::from_status(404, "gone", None).is_retryable());
        assert!(DeliveryError::from_status(429, "", Some(5)).is_retryable());

        assert!(!DeliveryError::configuration("bad header").is_retryable());
        assert!(!DeliveryError::internal("bug").is_retryable());
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            DeliveryError::from_status(429, "", Some(3)),
            DeliveryError::RateLimited { retry_after_seconds: Some(3), .. }
        ));
        assert!(matches!(
            DeliveryError::from_status(410, "", None),
            DeliveryError::ClientError { status_code: 410, .. }
        ));
        assert!(matches!(
            DeliveryError::from_status(302, "", None),
            DeliveryError::ServerError { status_code: 302, .. }
        ));
    }

    #[test]
    fn attempt_details_follow_the_error() {
        let err = DeliveryError::from_status(503, "unavailable", None);
        assert_eq!(err.status_code(), Some(503));
        assert_eq!(err.response_body(), Some("unavailable"));
        assert_eq!(err.attempt_outcome(), AttemptOutcome::HttpError);

        let err = DeliveryError::timeout(10);
        assert_eq!(err.status_code(), None);
        assert_eq!(err.attempt_outcome(), AttemptOutcome::Timeout);
        assert_eq!(DeliveryError::network("reset").attempt_outcome(), AttemptOutcome::ConnectionError);
    }

    #[test]
    fn categories_and_display() {
        assert_eq!(DeliveryError::network("x").category(), ErrorCategory::Network);
        assert_eq!(DeliveryError::from_status(429, "", None).category(), ErrorCategory::RateLimit);
        assert_eq!(ErrorCategory::Storage.to_string(), "storage");
        assert_eq!(DeliveryError::timeout(30).to_string(), "request timeout after 30s");
        assert_eq!(DeliveryError::from_status(500, "", None).to_string(), "server error: HTTP 500");
    }

    #[test]
    fn core_errors_become_storage_errors() {
        let err: DeliveryError = CoreError::Database("down".into()).into();
        assert_eq!(err.category(), ErrorCategory::Storage);
    }
}
