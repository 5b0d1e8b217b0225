//! Fan-out of accepted events into delivery tasks.
//!
//! The dispatcher claims pending events under a short lease, matches each
//! against the account's active subscriptions and enqueues one task per
//! match. Task creation is insert-if-absent, so an event whose lease lapsed
//! after a crash is simply dispatched again without duplicating work.

use std::{collections::HashSet, sync::Arc, time::Duration};

use courier_core::{storage::Storage, Clock, DeliveryTask, Event};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{chrono_duration, error::Result};

/// Wakes a sleeping loop ahead of its poll interval.
#[derive(Debug, Clone, Default)]
pub struct Wakeup(Arc<Notify>);

impl Wakeup {
    /// Creates a wakeup with no pending signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals one waiter, or the next one to wait.
    pub fn wake(&self) {
        self.0.notify_one();
    }

    /// Waits for a signal.
    pub async fn notified(&self) {
        self.0.notified().await;
    }
}

/// Dispatcher tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Events claimed per round.
    pub batch_size: usize,
    /// How long a claimed event stays hidden from other dispatchers.
    pub lease: Duration,
    /// Poll interval when nothing wakes the dispatcher.
    pub poll_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            lease: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Matches pending events to subscriptions and enqueues delivery tasks.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    storage: Storage,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
    wakeup: Wakeup,
    delivery_wakeup: Wakeup,
}

impl Dispatcher {
    /// Creates a dispatcher. `wakeup` triggers a round early;
    /// `delivery_wakeup` is signalled whenever new tasks were enqueued.
    pub fn new(
        storage: Storage,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
        wakeup: Wakeup,
        delivery_wakeup: Wakeup,
    ) -> Self {
        Self { storage, clock, config, wakeup, delivery_wakeup }
    }

    /// Dispatches one batch of pending events.
    ///
    /// Returns the number of events dispatched.
    ///
    /// # Errors
    ///
    /// Returns an error if claiming fails. Failures of individual events
    /// are logged; their lease lapses and they are dispatched again later.
    pub async fn dispatch_pending(&self) -> Result<usize> {
        let now = self.clock.now_utc();
        let lease_until = now + chrono_duration(self.config.lease);
        let events = self.storage.events.claim_pending(now, lease_until, self.config.batch_size).await?;

        let mut dispatched = 0;
        let mut enqueued_any = false;
        for event in events {
            let event_id = event.id;
            match self.dispatch(event).await {
                Ok(matched) => {
                    dispatched += 1;
                    enqueued_any |= matched > 0;
                },
                Err(error) => {
                    error!(event_id = %event_id, error = %error, "event dispatch failed");
                },
            }
        }

        if enqueued_any {
            self.delivery_wakeup.wake();
        }
        Ok(dispatched)
    }

    async fn dispatch(&self, event: Event) -> Result<u32> {
        let subscriptions = self.storage.subscriptions.list_active(event.account_id).await?;
        let targets: Option<HashSet<_>> =
            event.target_subscriptions.as_ref().map(|ids| ids.iter().copied().collect());

        let now = self.clock.now_utc();
        let mut matched = 0_u32;
        // Pinned targets were chosen explicitly and bypass the type filter.
        for subscription in subscriptions.iter().filter(|s| match &targets {
            Some(t) => s.is_active() && t.contains(&s.id),
            None => s.matches(&event),
        }) {
            let task = DeliveryTask::new(&event, subscription.id, now);
            let inserted = self.storage.tasks.enqueue(&task).await?;
            debug!(
                event_id = %event.id,
                subscription_id = %subscription.id,
                inserted,
                "delivery task enqueued"
            );
            matched += 1;
        }

        let dispatched = self.storage.events.mark_dispatched(event.id, matched).await?;
        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            matched,
            status = %dispatched.status,
            "event dispatched"
        );
        Ok(matched)
    }

    /// Dispatches until `cancellation_token` fires, waking on the wakeup
    /// signal or the poll interval.
    pub async fn run(&self, cancellation_token: CancellationToken) {
        info!("dispatcher starting");

        loop {
            if cancellation_token.is_cancelled() {
                break;
            }

            let idle = match self.dispatch_pending().await {
                Ok(count) => count < self.config.batch_size,
                Err(error) => {
                    error!(error = %error, "dispatcher round failed");
                    true
                },
            };

            if idle {
                tokio::select! {
                    () = self.wakeup.notified() => {}
                    () = self.clock.sleep(self.config.poll_interval) => {}
                    () = cancellation_token.cancelled() => break,
                }
            }
        }

        info!("dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use courier_core::{
        storage::{EventRepository, SubscriptionRepository, TaskRepository},
        AccountId, EventFilter, EventMetadata, EventStatus, Subscription, SubscriptionStatus,
        TestClock,
    };
    use serde_json::json;

    use super::*;

    struct Fixture {
        storage: Storage,
        dispatcher: Dispatcher,
        delivery_wakeup: Wakeup,
        account: AccountId,
    }

    fn fixture() -> Fixture {
        let storage = Storage::in_memory();
        let delivery_wakeup = Wakeup::new();
        let dispatcher = Dispatcher::new(
            storage.clone(),
            Arc::new(TestClock::new()),
            DispatcherConfig::default(),
            Wakeup::new(),
            delivery_wakeup.clone(),
        );
        Fixture { storage, dispatcher, delivery_wakeup, account: AccountId::new() }
    }

    async fn subscribe(f: &Fixture, types: &[&str]) -> Subscription {
        let subscription = Subscription::new(
            f.account,
            "http://localhost/hook",
            "secret",
            EventFilter::for_types(types.iter().copied()),
            Utc::now(),
        );
        f.storage.subscriptions.upsert(&subscription).await.unwrap();
        subscription
    }

    async fn ingest(f: &Fixture, event_type: &str) -> Event {
        let event =
            Event::new(f.account, event_type, "shop", json!({}), EventMetadata::default(), Utc::now());
        f.storage.events.insert(&event).await.unwrap();
        event
    }

    #[tokio::test]
    async fn enqueues_one_task_per_matching_subscription() {
        let f = fixture();
        let orders = subscribe(&f, &["order.*"]).await;
        let all = subscribe(&f, &[]).await;
        subscribe(&f, &["invoice.*"]).await;
        let event = ingest(&f, "order.created").await;

        assert_eq!(f.dispatcher.dispatch_pending().await.unwrap(), 1);

        let tasks = f.storage.tasks.list_for_event(event.id).await.unwrap();
        let mut targets: Vec<_> = tasks.iter().map(|t| t.subscription_id).collect();
        targets.sort_by_key(|id| id.0);
        let mut expected = vec![orders.id, all.id];
        expected.sort_by_key(|id| id.0);
        assert_eq!(targets, expected);

        let stored = f.storage.events.find(event.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Processing);
        assert_eq!(stored.matched_subscriptions, 2);
        tokio::time::timeout(Duration::from_secs(1), f.delivery_wakeup.notified()).await.unwrap();
    }

    #[tokio::test]
    async fn zero_matches_resolves_as_delivered() {
        let f = fixture();
        subscribe(&f, &["invoice.*"]).await;
        let event = ingest(&f, "order.created").await;

        f.dispatcher.dispatch_pending().await.unwrap();

        let stored = f.storage.events.find(event.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Delivered);
        assert_eq!(stored.delivery_attempts, 0);
        assert!(f.storage.tasks.list_for_event(event.id).await.unwrap().is_empty());
        assert!(stored.is_inbox_eligible());
    }

    #[tokio::test]
    async fn inactive_subscriptions_are_skipped() {
        let f = fixture();
        let mut paused = subscribe(&f, &[]).await;
        paused.status = SubscriptionStatus::Paused;
        f.storage.subscriptions.upsert(&paused).await.unwrap();
        let event = ingest(&f, "order.created").await;

        f.dispatcher.dispatch_pending().await.unwrap();

        let stored = f.storage.events.find(event.id).await.unwrap().unwrap();
        assert_eq!(stored.matched_subscriptions, 0);
    }

    #[tokio::test]
    async fn replay_targets_restrict_the_match_set() {
        let f = fixture();
        let chosen = subscribe(&f, &[]).await;
        subscribe(&f, &[]).await;

        let mut event =
            Event::new(f.account, "order.created", "shop", json!({}), EventMetadata::default(), Utc::now());
        event.target_subscriptions = Some(vec![chosen.id]);
        f.storage.events.insert(&event).await.unwrap();

        f.dispatcher.dispatch_pending().await.unwrap();

        let tasks = f.storage.tasks.list_for_event(event.id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].subscription_id, chosen.id);
    }

    #[tokio::test]
    async fn pinned_targets_bypass_the_type_filter() {
        let f = fixture();
        let invoices = subscribe(&f, &["invoice.*"]).await;

        let mut event =
            Event::new(f.account, "order.created", "shop", json!({}), EventMetadata::default(), Utc::now());
        event.target_subscriptions = Some(vec![invoices.id]);
        f.storage.events.insert(&event).await.unwrap();

        f.dispatcher.dispatch_pending().await.unwrap();

        let tasks = f.storage.tasks.list_for_event(event.id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].subscription_id, invoices.id);
        let stored = f.storage.events.find(event.id).await.unwrap().unwrap();
        assert_eq!(stored.matched_subscriptions, 1);
    }

    #[tokio::test]
    async fn dispatched_events_are_not_claimed_again() {
        let f = fixture();
        subscribe(&f, &[]).await;
        ingest(&f, "order.created").await;

        assert_eq!(f.dispatcher.dispatch_pending().await.unwrap(), 1);
        assert_eq!(f.dispatcher.dispatch_pending().await.unwrap(), 0);
    }
}
