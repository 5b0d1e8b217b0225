//! Error types for storage and domain operations.
//!
//! Every repository and core service returns [`CoreError`]. Each variant
//! carries a stable machine-readable code that the HTTP layer forwards to
//! clients unchanged.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for storage and domain operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A conditional write lost against a concurrent writer, or a state
    /// transition was not allowed.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A bounded counter (replays, batch size) is exhausted.
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// Stored data could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Returns the stable error code exposed to API clients.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "storage_unavailable",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::InvalidInput(_) => "validation_error",
            Self::LimitExceeded(_) => "limit_exceeded",
            Self::Serialization(_) => "internal_error",
        }
    }

    /// Returns whether retrying the same operation later may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Conflict(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::Conflict(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::InvalidInput(format!("check constraint violation: {db_err}"))
            },
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                Self::Serialization(err.to_string())
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(CoreError::NotFound("x".into()).code(), "not_found");
        assert_eq!(CoreError::InvalidInput("x".into()).code(), "validation_error");
        assert_eq!(CoreError::LimitExceeded("x".into()).code(), "limit_exceeded");
        assert_eq!(CoreError::Database("x".into()).code(), "storage_unavailable");
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(CoreError::Database("down".into()).is_retryable());
        assert!(CoreError::Conflict("race".into()).is_retryable());
        assert!(!CoreError::NotFound("gone".into()).is_retryable());
        assert!(!CoreError::InvalidInput("bad".into()).is_retryable());
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err: CoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
