//! Shared handler state.

use std::{sync::Arc, time::Duration};

use courier_core::{
    Clock, Inbox, InboxConfig, RateLimitTier, RateLimiter, Storage, StreamPublisher,
};
use courier_delivery::{DlqManager, ReplayConfig, ReplayEngine, Wakeup};

use crate::ingest::{IngestLimits, IngestionService};

/// Tunables for the HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ApiSettings {
    /// Ingestion size and retention limits.
    pub ingest: IngestLimits,
    /// Inbox visibility bounds.
    pub inbox: InboxConfig,
    /// Replay switch and cap.
    pub replay: ReplayConfig,
    /// Tier for credentials without their own.
    pub rate_limit: RateLimitTier,
    /// Upper bound on producing a response.
    pub request_timeout: Duration,
    /// Interval between stream heartbeats.
    pub stream_heartbeat: Duration,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            ingest: IngestLimits::default(),
            inbox: InboxConfig::default(),
            replay: ReplayConfig::default(),
            rate_limit: RateLimitTier::default(),
            request_timeout: Duration::from_secs(30),
            stream_heartbeat: Duration::from_secs(15),
        }
    }
}

/// Services shared by every handler.
#[derive(Clone)]
pub struct AppState {
    /// Repository handles.
    pub storage: Storage,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Event ingestion.
    pub ingestion: IngestionService,
    /// Polling inbox.
    pub inbox: Inbox,
    /// Dead letter queue operations.
    pub dlq: DlqManager,
    /// Event replay.
    pub replay: ReplayEngine,
    /// Live stream registry.
    pub stream: StreamPublisher,
    /// Tunables.
    pub settings: ApiSettings,
}

impl AppState {
    /// Wires the services over `storage`.
    ///
    /// `dispatch_wakeup` is signalled when new events are stored and
    /// `delivery_wakeup` when DLQ retries requeue tasks; both normally come
    /// from the running delivery engine.
    pub fn new(
        storage: Storage,
        clock: Arc<dyn Clock>,
        settings: ApiSettings,
        dispatch_wakeup: Wakeup,
        delivery_wakeup: Wakeup,
    ) -> Self {
        let stream = StreamPublisher::new();
        let rate_limiter =
            RateLimiter::new(storage.rate_limits.clone(), clock.clone(), settings.rate_limit);
        let ingestion = IngestionService::new(
            storage.clone(),
            clock.clone(),
            settings.ingest,
            rate_limiter,
            stream.clone(),
            dispatch_wakeup.clone(),
        );
        let inbox = Inbox::new(storage.inbox.clone(), clock.clone(), settings.inbox);
        let dlq = DlqManager::new(storage.clone(), clock.clone(), delivery_wakeup);
        let replay =
            ReplayEngine::new(storage.clone(), clock.clone(), settings.replay, dispatch_wakeup);

        Self { storage, clock, ingestion, inbox, dlq, replay, stream, settings }
    }
}
