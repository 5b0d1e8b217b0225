//! Inbox polling handlers.

use axum::{
    extract::{Query, State},
    Extension, Json,
};
use bytes::Bytes;
use courier_core::{Credential, InboxPage, Scope};
use serde::{Deserialize, Serialize};

use super::parse_json;
use crate::{error::ApiError, middleware::require_scope, state::AppState};

const DEFAULT_POLL_LIMIT: usize = 10;

/// `GET /inbox` query.
#[derive(Debug, Default, Deserialize)]
pub struct PollParams {
    /// Events to lease, 1 to the configured maximum.
    pub limit: Option<usize>,
    /// Visibility window in seconds.
    pub visibility_timeout: Option<u64>,
    /// Continue after a previous page.
    pub cursor: Option<String>,
}

/// `POST /inbox/ack` body.
#[derive(Debug, Deserialize)]
pub struct AckRequest {
    /// Handles from earlier polls.
    pub receipt_handles: Vec<String>,
}

/// Outcome for one receipt handle.
#[derive(Debug, Serialize)]
pub struct AckResult {
    /// The handle as submitted
    pub receipt_handle: String,
    /// Whether this call acknowledged the event
    pub acknowledged: bool,
}

/// `POST /inbox/ack` response.
#[derive(Debug, Serialize)]
pub struct AckResponse {
    /// Number of events acknowledged by this call
    pub acknowledged: usize,
    /// Per-handle outcomes, in request order
    pub results: Vec<AckResult>,
}

/// `POST /inbox/visibility` body.
#[derive(Debug, Deserialize)]
pub struct VisibilityRequest {
    /// Handle of an open lease.
    pub receipt_handle: String,
    /// New window in seconds, counted from now.
    pub visibility_timeout: u64,
}

/// `POST /inbox/visibility` response.
#[derive(Debug, Serialize)]
pub struct VisibilityResponse {
    /// The handle as submitted
    pub receipt_handle: String,
    /// Whether an open lease was changed
    pub updated: bool,
}

/// `GET /inbox`
pub async fn poll_inbox(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
    Query(params): Query<PollParams>,
) -> Result<Json<InboxPage>, ApiError> {
    require_scope(&credential, Scope::EventsRead)?;

    let page = state
        .inbox
        .list(
            credential.account_id,
            params.limit.unwrap_or(DEFAULT_POLL_LIMIT),
            params.visibility_timeout,
            params.cursor.as_deref(),
        )
        .await?;
    Ok(Json(page))
}

/// `POST /inbox/ack`
///
/// Unknown, expired and already-acknowledged handles are reported as not
/// acknowledged; they never fail the request.
pub async fn acknowledge(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
    body: Bytes,
) -> Result<Json<AckResponse>, ApiError> {
    require_scope(&credential, Scope::EventsRead)?;
    let request: AckRequest = parse_json(&body)?;

    let max = state.settings.inbox.max_batch;
    if request.receipt_handles.is_empty() || request.receipt_handles.len() > max {
        return Err(ApiError::Validation {
            message: format!("receipt_handles must contain between 1 and {max} handles"),
            field: Some("receipt_handles".to_string()),
        });
    }

    let mut results = Vec::with_capacity(request.receipt_handles.len());
    for receipt_handle in request.receipt_handles {
        let acknowledged = state.inbox.acknowledge(credential.account_id, &receipt_handle).await?;
        results.push(AckResult { receipt_handle, acknowledged });
    }

    let acknowledged = results.iter().filter(|r| r.acknowledged).count();
    Ok(Json(AckResponse { acknowledged, results }))
}

/// `POST /inbox/visibility`
pub async fn change_visibility(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
    body: Bytes,
) -> Result<Json<VisibilityResponse>, ApiError> {
    require_scope(&credential, Scope::EventsRead)?;
    let request: VisibilityRequest = parse_json(&body)?;

    let updated = state
        .inbox
        .change_visibility(credential.account_id, &request.receipt_handle, request.visibility_timeout)
        .await?;
    Ok(Json(VisibilityResponse { receipt_handle: request.receipt_handle, updated }))
}
