//! Delivery lifecycle notifications.
//!
//! Workers publish a [`DeliveryEvent`] for every attempt start, success,
//! failure and dead-lettering. Consumers implement [`EventHandler`]; the
//! default wiring installs [`TracingEventHandler`], which turns each
//! notification into a structured audit log line.
//!
//! ```text
//! ┌────────────────┐  DeliveryEvent  ┌──────────────────────┐
//! │ DeliveryWorker │ ──────────────▶ │ MulticastEventHandler│
//! └────────────────┘                 └──────────┬───────────┘
//!                                               ▼
//!                                    ┌──────────────────────┐
//!                                    │ TracingEventHandler  │
//!                                    │ (audit log)          │
//!                                    └──────────────────────┘
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::models::{AccountId, AttemptId, EventId, SubscriptionId};

/// Notifications emitted by the delivery worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeliveryEvent {
    /// An HTTP call is about to be made.
    AttemptStarted(DeliveryAttemptStartedEvent),

    /// The subscriber acknowledged the event with a 2xx.
    Succeeded(DeliverySucceededEvent),

    /// An attempt failed; `will_retry` tells whether another is scheduled.
    Failed(DeliveryFailedEvent),

    /// The pairing exhausted its retry budget and entered the DLQ.
    DeadLettered(DeliveryDeadLetteredEvent),
}

/// Emitted before each HTTP call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttemptStartedEvent {
    /// Attempt being made.
    pub attempt_id: AttemptId,
    /// Event being delivered.
    pub event_id: EventId,
    /// Owning account.
    pub account_id: AccountId,
    /// Destination.
    pub subscription_id: SubscriptionId,
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// When the call started.
    pub started_at: DateTime<Utc>,
}

/// Emitted after a 2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverySucceededEvent {
    /// Attempt that succeeded.
    pub attempt_id: AttemptId,
    /// Event delivered.
    pub event_id: EventId,
    /// Owning account.
    pub account_id: AccountId,
    /// Destination.
    pub subscription_id: SubscriptionId,
    /// Response status.
    pub status_code: u16,
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// Round-trip time in milliseconds.
    pub latency_ms: u64,
    /// When the delivery completed.
    pub delivered_at: DateTime<Utc>,
}

/// Emitted after a failed attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryFailedEvent {
    /// Attempt that failed.
    pub attempt_id: AttemptId,
    /// Event being delivered.
    pub event_id: EventId,
    /// Owning account.
    pub account_id: AccountId,
    /// Destination.
    pub subscription_id: SubscriptionId,
    /// Response status, when a response arrived.
    pub status_code: Option<u16>,
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// Failure description.
    pub error_message: String,
    /// Whether a retry is scheduled.
    pub will_retry: bool,
    /// When the retry is due.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// When the attempt failed.
    pub failed_at: DateTime<Utc>,
}

/// Emitted when a pairing is moved to the DLQ.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryDeadLetteredEvent {
    /// Event that could not be delivered.
    pub event_id: EventId,
    /// Owning account.
    pub account_id: AccountId,
    /// Destination.
    pub subscription_id: SubscriptionId,
    /// Attempts made before giving up.
    pub attempts: u32,
    /// Last failure reason.
    pub reason: String,
    /// When the item was created.
    pub dead_lettered_at: DateTime<Utc>,
}

/// Receiver of delivery notifications.
///
/// Implementations must not block delivery processing and must swallow
/// their own failures.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles a delivery notification.
    async fn handle_event(&self, event: DeliveryEvent);
}

/// Handler that discards every notification.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: DeliveryEvent) {}
}

/// Forwards every notification to all registered handlers concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a handler with no subscribers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Registers a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Returns the number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        let futures = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move {
                handler.handle_event(event).await;
            }
        });

        futures::future::join_all(futures).await;
    }
}

/// Writes each notification as a structured audit log line.
#[derive(Debug, Default)]
pub struct TracingEventHandler;

#[async_trait::async_trait]
impl EventHandler for TracingEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        match event {
            DeliveryEvent::AttemptStarted(e) => tracing::debug!(
                event_id = %e.event_id,
                subscription_id = %e.subscription_id,
                attempt = e.attempt_number,
                "delivery attempt started"
            ),
            DeliveryEvent::Succeeded(e) => info!(
                audit = true,
                event_id = %e.event_id,
                account_id = %e.account_id,
                subscription_id = %e.subscription_id,
                attempt = e.attempt_number,
                status_code = e.status_code,
                latency_ms = e.latency_ms,
                "delivery succeeded"
            ),
            DeliveryEvent::Failed(e) => warn!(
                audit = true,
                event_id = %e.event_id,
                account_id = %e.account_id,
                subscription_id = %e.subscription_id,
                attempt = e.attempt_number,
                status_code = ?e.status_code,
                will_retry = e.will_retry,
                error = %e.error_message,
                "delivery attempt failed"
            ),
            DeliveryEvent::DeadLettered(e) => warn!(
                audit = true,
                event_id = %e.event_id,
                account_id = %e.account_id,
                subscription_id = %e.subscription_id,
                attempts = e.attempts,
                reason = %e.reason,
                "delivery moved to dead letter queue"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug)]
    struct CountingHandler {
        count: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl EventHandler for CountingHandler {
        async fn handle_event(&self, _event: DeliveryEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn succeeded() -> DeliveryEvent {
        DeliveryEvent::Succeeded(DeliverySucceededEvent {
            attempt_id: AttemptId::new(),
            event_id: EventId::new(),
            account_id: AccountId::new(),
            subscription_id: SubscriptionId::new(),
            status_code: 200,
            attempt_number: 1,
            latency_ms: 12,
            delivered_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn multicast_forwards_to_every_subscriber() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut multicast = MulticastEventHandler::new();
        multicast.add_subscriber(Arc::new(CountingHandler { count: count.clone() }));
        multicast.add_subscriber(Arc::new(CountingHandler { count: count.clone() }));
        multicast.add_subscriber(Arc::new(TracingEventHandler));

        multicast.handle_event(succeeded()).await;

        assert_eq!(multicast.subscriber_count(), 3);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_multicast_and_noop_accept_events() {
        MulticastEventHandler::new().handle_event(succeeded()).await;
        NoOpEventHandler::new().handle_event(succeeded()).await;
    }
}
