//! Event replay.
//!
//! A replay never touches the original event's deliveries. It creates a new
//! pending event linked to the original through `replay_of` and
//! `metadata.causation_id`, pinned to the selected subscriptions, and lets
//! the dispatcher fan it out like any other event.

use std::sync::Arc;

use courier_core::{
    storage::Storage, AccountId, Clock, CoreError, Event, EventId, EventMetadata, Subscription,
    SubscriptionId,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dispatcher::Wakeup;

/// Replay settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Whether replays are accepted at all.
    pub enabled: bool,
    /// Replays allowed per original event.
    pub max_replays: u32,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self { enabled: true, max_replays: 3 }
    }
}

/// Body of a replay request.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReplayRequest {
    /// Report the selected subscriptions without replaying.
    pub dry_run: bool,
    /// Restrict the replay to these subscriptions.
    pub target_subscriptions: Option<Vec<SubscriptionId>>,
    /// Keys shallow-merged into the replayed event's data.
    pub payload_override: Option<Map<String, Value>>,
    /// Keys merged into the replayed event's metadata.
    pub metadata_override: Option<Map<String, Value>>,
}

/// Outcome of a replay request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayResult {
    /// Whether the replay was accepted.
    pub success: bool,
    /// The original event.
    pub event_id: EventId,
    /// The new event; absent for dry runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay_event_id: Option<EventId>,
    /// Whether this was a dry run.
    pub dry_run: bool,
    /// Subscriptions that receive (or would receive) the replay.
    pub target_subscriptions: Vec<SubscriptionId>,
    /// Human-readable summary.
    pub message: String,
    /// Replays still allowed for the original event.
    pub replays_remaining: u32,
}

/// Replay failures.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// The event does not exist in the caller's account.
    #[error("event {0} not found")]
    EventNotFound(EventId),

    /// Replay is disabled.
    #[error("event {0} cannot be replayed")]
    NotReplayable(EventId),

    /// The original already reached its replay cap.
    #[error("event {event_id} reached the replay limit of {cap}")]
    LimitExceeded {
        /// The original event
        event_id: EventId,
        /// Configured cap
        cap: u32,
    },

    /// A requested target is missing, inactive or owned by another account.
    #[error("subscription {0} not found")]
    SubscriptionNotFound(SubscriptionId),

    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] CoreError),
}

/// Re-dispatches stored events.
#[derive(Debug, Clone)]
pub struct ReplayEngine {
    storage: Storage,
    clock: Arc<dyn Clock>,
    config: ReplayConfig,
    dispatch_wakeup: Wakeup,
}

impl ReplayEngine {
    /// Creates a replay engine; `dispatch_wakeup` is signalled after each
    /// replay event is stored.
    pub fn new(
        storage: Storage,
        clock: Arc<dyn Clock>,
        config: ReplayConfig,
        dispatch_wakeup: Wakeup,
    ) -> Self {
        Self { storage, clock, config, dispatch_wakeup }
    }

    /// Replays `event_id`, or reports what a replay would do.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::LimitExceeded` once the original has been
    /// replayed `max_replays` times; dry runs never count against the cap.
    pub async fn replay(
        &self,
        account_id: AccountId,
        event_id: EventId,
        request: ReplayRequest,
    ) -> Result<ReplayResult, ReplayError> {
        let original = self
            .storage
            .events
            .find(event_id)
            .await?
            .filter(|event| event.account_id == account_id)
            .ok_or(ReplayError::EventNotFound(event_id))?;

        if !self.config.enabled {
            return Err(ReplayError::NotReplayable(event_id));
        }

        let targets = self.select_targets(&original, request.target_subscriptions.as_deref()).await?;
        let target_ids: Vec<SubscriptionId> = targets.iter().map(|s| s.id).collect();

        if request.dry_run {
            let replays_remaining = self.config.max_replays.saturating_sub(original.replay_count);
            debug!(event_id = %event_id, targets = target_ids.len(), "replay dry run");
            return Ok(ReplayResult {
                success: true,
                event_id,
                replay_event_id: None,
                dry_run: true,
                message: format!("dry run: {} subscription(s) would receive the event", target_ids.len()),
                target_subscriptions: target_ids,
                replays_remaining,
            });
        }

        let replay_count = self
            .storage
            .events
            .increment_replay_count(event_id, self.config.max_replays)
            .await?
            .ok_or(ReplayError::LimitExceeded { event_id, cap: self.config.max_replays })?;

        let replay = self.build_replay(&original, &request, target_ids.clone());
        if let Err(err) = self.storage.events.insert(&replay).await {
            if let Err(release_err) = self.storage.events.release_replay_slot(event_id).await {
                warn!(event_id = %event_id, error = %release_err, "failed to release replay slot");
            }
            return Err(err.into());
        }
        self.dispatch_wakeup.wake();

        info!(
            audit = true,
            account_id = %account_id,
            event_id = %event_id,
            replay_event_id = %replay.id,
            replay_count,
            targets = target_ids.len(),
            "event replayed"
        );

        Ok(ReplayResult {
            success: true,
            event_id,
            replay_event_id: Some(replay.id),
            dry_run: false,
            message: format!("replay queued for {} subscription(s)", target_ids.len()),
            target_subscriptions: target_ids,
            replays_remaining: self.config.max_replays.saturating_sub(replay_count),
        })
    }

    /// Active subscriptions matching the event, or exactly `requested` when
    /// given, regardless of their filters.
    async fn select_targets(
        &self,
        event: &Event,
        requested: Option<&[SubscriptionId]>,
    ) -> Result<Vec<Subscription>, ReplayError> {
        let active = self.storage.subscriptions.list_active(event.account_id).await?;

        let Some(requested) = requested else {
            return Ok(active.into_iter().filter(|s| s.matches(event)).collect());
        };

        for id in requested {
            if !active.iter().any(|s| s.id == *id) {
                return Err(ReplayError::SubscriptionNotFound(*id));
            }
        }
        Ok(active.into_iter().filter(|s| requested.contains(&s.id)).collect())
    }

    fn build_replay(
        &self,
        original: &Event,
        request: &ReplayRequest,
        targets: Vec<SubscriptionId>,
    ) -> Event {
        let mut data = original.data.clone();
        if let Some(overrides) = &request.payload_override {
            merge_object(&mut data, overrides);
        }

        let mut metadata = EventMetadata {
            idempotency_key: None,
            correlation_id: original.metadata.correlation_id.clone(),
            causation_id: Some(original.id.to_string()),
            extra: original.metadata.extra.clone(),
        };
        if let Some(overrides) = &request.metadata_override {
            for (key, value) in overrides {
                match key.as_str() {
                    "correlation_id" => metadata.correlation_id = value.as_str().map(str::to_owned),
                    "idempotency_key" | "causation_id" => {},
                    _ => {
                        metadata.extra.insert(key.clone(), value.clone());
                    },
                }
            }
        }

        let mut replay = Event::new(
            original.account_id,
            original.event_type.clone(),
            original.source.clone(),
            data,
            metadata,
            self.clock.now_utc(),
        );
        replay.replay_of = Some(original.id);
        replay.target_subscriptions = Some(targets);
        replay
    }
}

fn merge_object(target: &mut Value, overrides: &Map<String, Value>) {
    match target {
        Value::Object(map) => {
            for (key, value) in overrides {
                map.insert(key.clone(), value.clone());
            }
        },
        other => *other = Value::Object(overrides.clone()),
    }
}
