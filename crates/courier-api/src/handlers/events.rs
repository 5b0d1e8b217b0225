//! Event ingestion, listing, detail and replay handlers.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use courier_core::{
    Credential, DeliveryAttempt, DeliveryTask, Event, EventId, Scope, SubscriptionId, TaskStatus,
};
use courier_delivery::ReplayRequest;
use serde::Serialize;
use tracing::instrument;

use super::{check_body_size, insert_rate_limit_headers, parse_json};
use crate::{
    error::ApiError,
    ingest::{BatchRequest, EventList, EventListQuery, NewEvent},
    middleware::require_scope,
    state::AppState,
};

const IDEMPOTENCY_HEADER: &str = "x-idempotency-key";

/// Delivery state of one subscription for an event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliverySummary {
    /// Destination subscription
    pub subscription_id: SubscriptionId,
    /// Queue state of the delivery
    pub status: TaskStatus,
    /// Attempts made in the current run
    pub attempts: u32,
    /// When the next attempt is due, while one is pending
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Most recent failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Operator retries from the DLQ
    pub dlq_retries: u32,
}

impl From<DeliveryTask> for DeliverySummary {
    fn from(task: DeliveryTask) -> Self {
        let pending = matches!(task.status, TaskStatus::Queued | TaskStatus::Leased);
        Self {
            subscription_id: task.subscription_id,
            status: task.status,
            attempts: task.attempt_number,
            next_attempt_at: pending.then_some(task.next_attempt_at),
            last_error: task.last_error,
            dlq_retries: task.dlq_retries,
        }
    }
}

/// Event with its delivery state.
#[derive(Debug, Clone, Serialize)]
pub struct EventDetail {
    /// The event
    #[serde(flatten)]
    pub event: Event,
    /// One entry per matched subscription
    pub deliveries: Vec<DeliverySummary>,
    /// Every HTTP call made for the event, oldest first
    pub attempts: Vec<DeliveryAttempt>,
}

/// `POST /events`
///
/// Returns `201` for a new event and `200` when the idempotency key already
/// maps to one.
#[instrument(
    name = "create_event",
    skip_all,
    fields(account_id = %credential.account_id, content_length = body.len())
)]
pub async fn create_event(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    require_scope(&credential, Scope::EventsWrite)?;
    check_body_size(&body, state.ingestion.limits().max_request_bytes())?;
    let request: NewEvent = parse_json(&body)?;

    let header_key = headers.get(IDEMPOTENCY_HEADER).and_then(|v| v.to_str().ok());
    let outcome = state.ingestion.ingest(&credential, request, header_key).await?;

    let status = if outcome.created { StatusCode::CREATED } else { StatusCode::OK };
    let mut response = (status, Json(outcome.event)).into_response();
    if let Some(decision) = outcome.rate_limit {
        insert_rate_limit_headers(response.headers_mut(), &decision);
    }
    Ok(response)
}

/// `POST /events/batch`
#[instrument(
    name = "create_batch",
    skip_all,
    fields(account_id = %credential.account_id, content_length = body.len())
)]
pub async fn create_batch(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
    body: Bytes,
) -> Result<Response, ApiError> {
    require_scope(&credential, Scope::EventsWrite)?;
    check_body_size(&body, state.ingestion.limits().max_batch_bytes)?;
    let request: BatchRequest = parse_json(&body)?;

    let outcome = state.ingestion.ingest_batch(&credential, request).await?;

    let mut response = Json(outcome.summary).into_response();
    insert_rate_limit_headers(response.headers_mut(), &outcome.rate_limit);
    Ok(response)
}

/// `GET /events`
pub async fn list_events(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
    Query(query): Query<EventListQuery>,
) -> Result<Json<EventList>, ApiError> {
    require_scope(&credential, Scope::EventsRead)?;
    let page = state.ingestion.list_events(credential.account_id, query).await?;
    Ok(Json(page))
}

/// `GET /events/{event_id}`
pub async fn get_event(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
    Path(event_id): Path<EventId>,
) -> Result<Json<EventDetail>, ApiError> {
    require_scope(&credential, Scope::EventsRead)?;

    let event = state.ingestion.find_event(credential.account_id, event_id).await?.ok_or_else(
        || ApiError::NotFound { code: "event_not_found", message: format!("event {event_id} not found") },
    )?;
    let tasks = state.storage.tasks.list_for_event(event_id).await?;
    let attempts = state.storage.attempts.list_for_event(event_id).await?;

    Ok(Json(EventDetail {
        event,
        deliveries: tasks.into_iter().map(DeliverySummary::from).collect(),
        attempts,
    }))
}

/// `POST /events/{event_id}/replay`
///
/// An empty body replays to every active matching subscription.
#[instrument(name = "replay_event", skip_all, fields(event_id = %event_id))]
pub async fn replay_event(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
    Path(event_id): Path<EventId>,
    body: Bytes,
) -> Result<Response, ApiError> {
    require_scope(&credential, Scope::DlqManage)?;
    let request: ReplayRequest =
        if body.is_empty() { ReplayRequest::default() } else { parse_json(&body)? };

    let result = state.replay.replay(credential.account_id, event_id, request).await?;

    let status = if result.replay_event_id.is_some() { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(result)).into_response())
}
