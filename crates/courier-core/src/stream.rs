//! Live event fan-out to connected stream consumers.
//!
//! Each consumer registers a bounded channel under its account. Publishing
//! never waits: a consumer whose buffer is full is unregistered, which ends
//! its stream once it drains what was buffered. Consumers that went away
//! are pruned the same way.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    filter::EventFilter,
    models::{AccountId, Event},
};

/// Events buffered per consumer before it is dropped as too slow.
pub const STREAM_BUFFER: usize = 256;

struct Subscriber {
    filter: EventFilter,
    tx: mpsc::Sender<Event>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    accounts: HashMap<AccountId, HashMap<u64, Subscriber>>,
}

impl Registry {
    fn remove(&mut self, account_id: AccountId, id: u64) {
        if let Some(subscribers) = self.accounts.get_mut(&account_id) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                self.accounts.remove(&account_id);
            }
        }
    }
}

/// Registry of live stream consumers.
#[derive(Clone, Default)]
pub struct StreamPublisher {
    registry: Arc<Mutex<Registry>>,
}

impl StreamPublisher {
    /// Creates an empty publisher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a consumer for `account_id` events passing `filter`.
    ///
    /// The consumer is unregistered when the returned subscription drops.
    pub fn subscribe(&self, account_id: AccountId, filter: EventFilter) -> StreamSubscription {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.accounts.entry(account_id).or_default().insert(id, Subscriber { filter, tx });

        StreamSubscription { rx, id, account_id, registry: self.registry.clone() }
    }

    /// Offers `event` to every matching consumer of its account.
    ///
    /// Returns the number of consumers the event was queued for.
    pub fn publish(&self, event: &Event) -> usize {
        let mut registry = self.registry.lock();
        let Some(subscribers) = registry.accounts.get_mut(&event.account_id) else {
            return 0;
        };

        let mut delivered = 0;
        subscribers.retain(|id, subscriber| {
            if !subscriber.filter.matches(&event.event_type, &event.source) {
                return true;
            }
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                },
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(subscriber = id, event_id = %event.id, "stream consumer lagging, dropping consumer");
                    false
                },
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        if subscribers.is_empty() {
            registry.accounts.remove(&event.account_id);
        }
        delivered
    }

    /// Returns the number of consumers connected for `account_id`.
    pub fn subscriber_count(&self, account_id: AccountId) -> usize {
        self.registry.lock().accounts.get(&account_id).map_or(0, HashMap::len)
    }
}

impl std::fmt::Debug for StreamPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let accounts = self.registry.lock().accounts.len();
        f.debug_struct("StreamPublisher").field("accounts", &accounts).finish()
    }
}

/// Receiving end of a stream registration.
pub struct StreamSubscription {
    rx: mpsc::Receiver<Event>,
    id: u64,
    account_id: AccountId,
    registry: Arc<Mutex<Registry>>,
}

impl StreamSubscription {
    /// Waits for the next event. Returns `None` once the publisher is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

impl Drop for StreamSubscription {
    fn drop(&mut self) {
        self.registry.lock().remove(self.account_id, self.id);
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::models::EventMetadata;

    fn event(account_id: AccountId, event_type: &str) -> Event {
        Event::new(account_id, event_type, "shop", json!({}), EventMetadata::default(), Utc::now())
    }

    #[tokio::test]
    async fn publishes_only_to_matching_consumers_of_the_account() {
        let publisher = StreamPublisher::new();
        let account = AccountId::new();
        let mut orders = publisher.subscribe(account, EventFilter::for_types(["order.*"]));
        let mut everything = publisher.subscribe(account, EventFilter::default());
        let mut other = publisher.subscribe(AccountId::new(), EventFilter::default());

        assert_eq!(publisher.publish(&event(account, "invoice.paid")), 1);
        assert_eq!(publisher.publish(&event(account, "order.created")), 2);

        assert_eq!(everything.recv().await.unwrap().event_type, "invoice.paid");
        assert_eq!(everything.recv().await.unwrap().event_type, "order.created");
        assert_eq!(orders.recv().await.unwrap().event_type, "order.created");
        assert!(other.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn lagging_consumer_is_dropped_and_its_stream_ends() {
        let publisher = StreamPublisher::new();
        let account = AccountId::new();
        let mut slow = publisher.subscribe(account, EventFilter::default());
        let _fast = publisher.subscribe(account, EventFilter::for_types(["order.*"]));

        for _ in 0..STREAM_BUFFER {
            assert_eq!(publisher.publish(&event(account, "tick")), 1);
        }
        assert_eq!(publisher.publish(&event(account, "tick")), 0);
        assert_eq!(publisher.subscriber_count(account), 1);

        let mut drained = 0;
        while slow.recv().await.is_some() {
            drained += 1;
        }
        assert_eq!(drained, STREAM_BUFFER);
        assert_eq!(publisher.publish(&event(account, "order.created")), 1);
    }

    #[test]
    fn dropping_the_subscription_unregisters_it() {
        let publisher = StreamPublisher::new();
        let account = AccountId::new();

        let subscription = publisher.subscribe(account, EventFilter::default());
        assert_eq!(publisher.subscriber_count(account), 1);

        drop(subscription);
        assert_eq!(publisher.subscriber_count(account), 0);
        assert_eq!(publisher.publish(&event(account, "order.created")), 0);
    }
}
