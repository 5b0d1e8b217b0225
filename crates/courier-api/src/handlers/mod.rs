//! HTTP request handlers.
//!
//! Handlers are grouped by surface:
//! - `events` - ingestion, listing, detail and replay
//! - `inbox` - polling, acknowledgment and visibility changes
//! - `dlq` - dead letter queue listing, retry and dismissal
//! - `stream` - server-sent event stream of new events
//! - `health` - liveness, readiness and detailed health
//!
//! Every authenticated handler checks its scope first and returns
//! [`ApiError`] on failure, which renders the standard error body.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use bytes::Bytes;
use courier_core::RateLimitDecision;
use serde::de::DeserializeOwned;

use crate::error::ApiError;

pub mod dlq;
pub mod events;
pub mod health;
pub mod inbox;
pub mod stream;

pub use dlq::{dismiss_dlq, dlq_stats, list_dlq, retry_dlq};
pub use events::{create_batch, create_event, get_event, list_events, replay_event};
pub use health::{health_check, liveness_check, readiness_check};
pub use inbox::{acknowledge, change_visibility, poll_inbox};
pub use stream::stream_events;

const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Adds the `X-RateLimit-*` headers, plus `Retry-After` on denial.
pub(crate) fn insert_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(decision.reset_at.timestamp()));
    if let Some(retry_after) = decision.retry_after {
        headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from(retry_after.as_secs()));
    }
}

/// Parses a JSON body, reporting serde's message as a validation error.
pub(crate) fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::validation(format!("invalid request body: {e}")))
}

/// Rejects bodies larger than `limit` bytes.
pub(crate) fn check_body_size(body: &Bytes, limit: usize) -> Result<(), ApiError> {
    if body.len() > limit {
        return Err(ApiError::PayloadTooLarge { limit });
    }
    Ok(())
}
