//! Server-sent event stream of newly accepted events.
//!
//! Frames:
//! - `connected` once, right after the stream opens
//! - `event` per matching event, with the event id as the SSE id
//! - `heartbeat` on a fixed interval while the stream is idle or busy
//!
//! There is no catch-up: a consumer sees only events accepted while it is
//! connected. A consumer that falls behind by more than the buffer is
//! dropped and its stream ends.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Query, State},
    response::sse::{Event as SseEvent, Sse},
    Extension,
};
use courier_core::{Clock, Credential, EventFilter, Scope, StreamSubscription};
use futures::{stream, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::time::{interval_at, Instant, Interval};
use tracing::info;

use crate::{error::ApiError, middleware::require_scope, state::AppState};

/// `GET /events/stream` query.
#[derive(Debug, Default, Deserialize)]
pub struct StreamParams {
    /// Comma-separated type globs; all types when absent.
    pub types: Option<String>,
    /// Comma-separated sources; all sources when absent.
    pub sources: Option<String>,
}

fn split_list(list: Option<&str>) -> Vec<String> {
    list.map(|s| {
        s.split(',').map(str::trim).filter(|part| !part.is_empty()).map(str::to_string).collect()
    })
    .unwrap_or_default()
}

struct StreamState {
    subscription: StreamSubscription,
    heartbeat: Interval,
    clock: Arc<dyn Clock>,
}

async fn next_frame(mut state: StreamState) -> Option<(Result<SseEvent, Infallible>, StreamState)> {
    let frame = tokio::select! {
        event = state.subscription.recv() => {
            let event = event?;
            SseEvent::default()
                .event("event")
                .id(event.id.to_string())
                .data(event.payload().to_string())
        },
        _ = state.heartbeat.tick() => {
            SseEvent::default()
                .event("heartbeat")
                .data(json!({"timestamp": state.clock.now_utc()}).to_string())
        },
    };
    Some((Ok(frame), state))
}

/// `GET /events/stream`
pub async fn stream_events(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
    Query(params): Query<StreamParams>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    require_scope(&credential, Scope::EventsRead)?;

    let mut types = split_list(params.types.as_deref());
    if types.is_empty() {
        types.push("*".to_string());
    }
    let sources = split_list(params.sources.as_deref());
    let filter = EventFilter::for_types(types.clone()).with_sources(sources.clone());

    let account_id = credential.account_id;
    let subscription = state.stream.subscribe(account_id, filter);
    info!(account_id = %account_id, ?types, ?sources, "stream opened");

    let period = state.settings.stream_heartbeat;
    let connected = SseEvent::default().event("connected").data(
        json!({
            "account_id": account_id,
            "types": types,
            "sources": sources,
            "heartbeat_seconds": period.as_secs(),
        })
        .to_string(),
    );

    let frames = stream::unfold(
        StreamState {
            subscription,
            heartbeat: interval_at(Instant::now() + period, period),
            clock: state.clock.clone(),
        },
        next_frame,
    );

    Ok(Sse::new(stream::once(async move { Ok::<_, Infallible>(connected) }).chain(frames)))
}
