//! Dead letter queue handlers.

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use courier_core::{
    storage::{DlqQuery, DlqStats},
    Credential, DlqItem, EventId, Scope, SubscriptionId,
};
use courier_delivery::DlqRetryOutcome;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{error::ApiError, middleware::require_scope, state::AppState};

const DEFAULT_PAGE_SIZE: usize = 50;

/// `GET /dlq` query.
#[derive(Debug, Default, Deserialize)]
pub struct DlqListParams {
    /// Exact event type.
    pub event_type: Option<String>,
    /// Exact source.
    pub source: Option<String>,
    /// Destination subscription.
    pub subscription_id: Option<SubscriptionId>,
    /// Page size, 1 to 100.
    pub limit: Option<usize>,
    /// Items to skip.
    pub offset: Option<usize>,
}

/// Restricts retry and dismiss to one subscription.
#[derive(Debug, Default, Deserialize)]
pub struct DlqTarget {
    /// Only act on this subscription's item.
    pub subscription_id: Option<SubscriptionId>,
}

/// `GET /dlq` response.
#[derive(Debug, Serialize)]
pub struct DlqListResponse {
    /// Items on this page, newest first
    pub items: Vec<DlqItem>,
    /// Items matching the filters
    pub total: u64,
    /// Page size used
    pub limit: usize,
    /// Items skipped
    pub offset: usize,
}

/// `DELETE /dlq/{event_id}` response.
#[derive(Debug, Serialize)]
pub struct DismissResponse {
    /// The event
    pub event_id: EventId,
    /// Subscriptions whose items were dismissed
    pub dismissed: Vec<SubscriptionId>,
}

/// `GET /dlq`
pub async fn list_dlq(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
    Query(params): Query<DlqListParams>,
) -> Result<Json<DlqListResponse>, ApiError> {
    require_scope(&credential, Scope::DlqManage)?;

    let query = DlqQuery {
        event_type: params.event_type,
        source: params.source,
        subscription_id: params.subscription_id,
        limit: params.limit.unwrap_or(DEFAULT_PAGE_SIZE),
        offset: params.offset.unwrap_or(0),
    };
    let page = state.dlq.list(credential.account_id, &query).await?;

    Ok(Json(DlqListResponse {
        items: page.items,
        total: page.total,
        limit: query.limit,
        offset: query.offset,
    }))
}

/// `GET /dlq/stats`
pub async fn dlq_stats(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
) -> Result<Json<DlqStats>, ApiError> {
    require_scope(&credential, Scope::DlqManage)?;
    Ok(Json(state.dlq.stats(credential.account_id).await?))
}

/// `POST /dlq/{event_id}/retry`
#[instrument(name = "retry_dlq", skip_all, fields(event_id = %event_id))]
pub async fn retry_dlq(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
    Path(event_id): Path<EventId>,
    Query(target): Query<DlqTarget>,
) -> Result<Json<DlqRetryOutcome>, ApiError> {
    require_scope(&credential, Scope::DlqManage)?;
    let outcome = state.dlq.retry(credential.account_id, event_id, target.subscription_id).await?;
    Ok(Json(outcome))
}

/// `DELETE /dlq/{event_id}`
#[instrument(name = "dismiss_dlq", skip_all, fields(event_id = %event_id))]
pub async fn dismiss_dlq(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
    Path(event_id): Path<EventId>,
    Query(target): Query<DlqTarget>,
) -> Result<Json<DismissResponse>, ApiError> {
    require_scope(&credential, Scope::DlqManage)?;
    let removed =
        state.dlq.dismiss(credential.account_id, event_id, target.subscription_id).await?;

    Ok(Json(DismissResponse {
        event_id,
        dismissed: removed.into_iter().map(|item| item.subscription_id).collect(),
    }))
}
