//! Polling inbox with visibility timeouts.
//!
//! Consumers that cannot accept webhooks poll for unacknowledged events.
//! Each returned event is hidden from other pollers for a visibility window
//! and carries a receipt handle; acknowledging the handle removes the event
//! from the inbox for good. Unacknowledged events reappear once the window
//! lapses.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{CoreError, Result},
    models::{AccountId, LeasedEvent},
    storage::{EventCursor, InboxRepository},
    time::Clock,
};

/// Visibility window bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxConfig {
    /// Window applied when the poller does not ask for one, in seconds.
    pub default_visibility_secs: u64,
    /// Largest window a poller may ask for, in seconds.
    pub max_visibility_secs: u64,
    /// Largest page a poller may ask for.
    pub max_batch: usize,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self { default_visibility_secs: 30, max_visibility_secs: 43_200, max_batch: 100 }
    }
}

/// Page of leased events.
#[derive(Debug, Clone, Serialize)]
pub struct InboxPage {
    /// Leased events, oldest first.
    pub events: Vec<LeasedEvent>,
    /// Cursor to continue after the last event, when the page was full.
    pub next_cursor: Option<String>,
}

/// Inbox service over the lease store.
#[derive(Clone)]
pub struct Inbox {
    repository: Arc<dyn InboxRepository>,
    clock: Arc<dyn Clock>,
    config: InboxConfig,
}

impl Inbox {
    /// Creates an inbox over `repository`.
    pub fn new(
        repository: Arc<dyn InboxRepository>,
        clock: Arc<dyn Clock>,
        config: InboxConfig,
    ) -> Self {
        Self { repository, clock, config }
    }

    /// Leases up to `limit` events for `account_id`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` for a zero or oversized limit, a
    /// zero or oversized visibility window, or a malformed cursor.
    pub async fn list(
        &self,
        account_id: AccountId,
        limit: usize,
        visibility_secs: Option<u64>,
        cursor: Option<&str>,
    ) -> Result<InboxPage> {
        if limit == 0 || limit > self.config.max_batch {
            return Err(CoreError::InvalidInput(format!(
                "limit must be between 1 and {}",
                self.config.max_batch
            )));
        }
        let window = self.window(visibility_secs)?;
        let after = cursor.map(EventCursor::decode).transpose()?;

        let now = self.clock.now_utc();
        let visible_until = now + window;
        let events = self.repository.lease(account_id, after, limit, visible_until, now).await?;

        let next_cursor = if events.len() == limit {
            events.last().map(|leased| EventCursor::of(&leased.event).encode())
        } else {
            None
        };

        debug!(account_id = %account_id, leased = events.len(), "inbox poll");
        Ok(InboxPage { events, next_cursor })
    }

    /// Acknowledges the event behind `receipt_handle`.
    ///
    /// Returns `false` when the handle is unknown or its lease lapsed; the
    /// inbox is unchanged in that case.
    pub async fn acknowledge(&self, account_id: AccountId, receipt_handle: &str) -> Result<bool> {
        let acked =
            self.repository.acknowledge(account_id, receipt_handle, self.clock.now_utc()).await?;
        debug!(account_id = %account_id, acked, "inbox acknowledge");
        Ok(acked)
    }

    /// Restarts the visibility window of an open lease at `visibility_secs`
    /// from now.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` for a window outside the allowed
    /// range.
    pub async fn change_visibility(
        &self,
        account_id: AccountId,
        receipt_handle: &str,
        visibility_secs: u64,
    ) -> Result<bool> {
        let window = self.window(Some(visibility_secs))?;
        let now = self.clock.now_utc();
        self.repository.change_visibility(account_id, receipt_handle, now + window, now).await
    }

    fn window(&self, visibility_secs: Option<u64>) -> Result<chrono::Duration> {
        let secs = visibility_secs.unwrap_or(self.config.default_visibility_secs);
        if secs == 0 || secs > self.config.max_visibility_secs {
            return Err(CoreError::InvalidInput(format!(
                "visibility timeout must be between 1 and {} seconds",
                self.config.max_visibility_secs
            )));
        }
        chrono::Duration::from_std(Duration::from_secs(secs))
            .map_err(|e| CoreError::InvalidInput(e.to_string()))
    }
}

impl std::fmt::Debug for Inbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbox").field("config", &self.config).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        models::{Event, EventMetadata, EventStatus},
        storage::{EventRepository, MemoryStore},
        time::TestClock,
    };

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: TestClock,
        inbox: Inbox,
        account: AccountId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = TestClock::new();
        let inbox = Inbox::new(store.clone(), Arc::new(clock.clone()), InboxConfig::default());
        Fixture { store, clock, inbox, account: AccountId::new() }
    }

    async fn seed(f: &Fixture, n: usize) -> Vec<Event> {
        let mut events = Vec::new();
        for i in 0..n {
            let event = Event::new(
                f.account,
                "order.created",
                "shop",
                json!({ "n": i }),
                EventMetadata::default(),
                f.clock.now_utc(),
            );
            f.store.insert(&event).await.unwrap();
            events.push(event);
            f.clock.advance_secs(1);
        }
        events
    }

    #[tokio::test]
    async fn leased_events_are_hidden_until_the_window_lapses() {
        let f = fixture();
        let events = seed(&f, 2).await;

        let first = f.inbox.list(f.account, 10, Some(60), None).await.unwrap();
        assert_eq!(first.events.len(), 2);
        assert_eq!(first.events[0].event.id, events[0].id);
        assert_eq!(first.events[0].delivery_count, 1);
        assert!(first.next_cursor.is_none());

        let hidden = f.inbox.list(f.account, 10, None, None).await.unwrap();
        assert!(hidden.events.is_empty());

        f.clock.advance_secs(61);
        let again = f.inbox.list(f.account, 10, None, None).await.unwrap();
        assert_eq!(again.events.len(), 2);
        assert_eq!(again.events[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn acknowledge_removes_event_and_is_idempotent() {
        let f = fixture();
        seed(&f, 1).await;

        let page = f.inbox.list(f.account, 1, None, None).await.unwrap();
        let handle = page.events[0].receipt_handle.clone();

        assert!(f.inbox.acknowledge(f.account, &handle).await.unwrap());
        assert!(!f.inbox.acknowledge(f.account, &handle).await.unwrap());
        assert!(!f.inbox.acknowledge(f.account, "rcpt_unknown").await.unwrap());

        f.clock.advance_secs(3_600);
        assert!(f.inbox.list(f.account, 10, None, None).await.unwrap().events.is_empty());
    }

    #[tokio::test]
    async fn lapsed_handle_cannot_acknowledge() {
        let f = fixture();
        seed(&f, 1).await;

        let page = f.inbox.list(f.account, 1, Some(5), None).await.unwrap();
        f.clock.advance_secs(6);

        assert!(!f.inbox.acknowledge(f.account, &page.events[0].receipt_handle).await.unwrap());
    }

    #[tokio::test]
    async fn change_visibility_extends_an_open_lease() {
        let f = fixture();
        seed(&f, 1).await;

        let page = f.inbox.list(f.account, 1, Some(5), None).await.unwrap();
        let handle = &page.events[0].receipt_handle;
        assert!(f.inbox.change_visibility(f.account, handle, 120).await.unwrap());

        f.clock.advance_secs(60);
        assert!(f.inbox.list(f.account, 10, None, None).await.unwrap().events.is_empty());
        assert!(f.inbox.acknowledge(f.account, handle).await.unwrap());
    }

    #[tokio::test]
    async fn full_page_returns_a_cursor() {
        let f = fixture();
        let events = seed(&f, 3).await;

        let page = f.inbox.list(f.account, 2, None, None).await.unwrap();
        let cursor = page.next_cursor.unwrap();

        let rest = f.inbox.list(f.account, 2, None, Some(&cursor)).await.unwrap();
        assert_eq!(rest.events.len(), 1);
        assert_eq!(rest.events[0].event.id, events[2].id);
    }

    #[tokio::test]
    async fn resolved_events_with_subscribers_are_not_offered() {
        let f = fixture();
        let events = seed(&f, 1).await;
        f.store.mark_dispatched(events[0].id, 1).await.unwrap();
        f.store
            .record_outcome(events[0].id, crate::storage::OutcomeDelta::delivered())
            .await
            .unwrap();

        let stored = f.store.find(events[0].id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Delivered);
        assert!(f.inbox.list(f.account, 10, None, None).await.unwrap().events.is_empty());
    }

    #[tokio::test]
    async fn lapsed_leases_are_purged_once_the_event_leaves_the_inbox() {
        let f = fixture();
        let events = seed(&f, 2).await;

        f.inbox.list(f.account, 10, Some(5), None).await.unwrap();
        f.store.mark_dispatched(events[0].id, 1).await.unwrap();
        f.store
            .record_outcome(events[0].id, crate::storage::OutcomeDelta::delivered())
            .await
            .unwrap();

        let now = f.clock.now_utc();
        assert_eq!(InboxRepository::purge_expired(&*f.store, now).await.unwrap(), 0);

        f.clock.advance_secs(6);
        let later = f.clock.now_utc();
        assert_eq!(InboxRepository::purge_expired(&*f.store, later).await.unwrap(), 1);
        assert_eq!(InboxRepository::purge_expired(&*f.store, later).await.unwrap(), 0);

        let again = f.inbox.list(f.account, 10, None, None).await.unwrap();
        assert_eq!(again.events.len(), 1);
        assert_eq!(again.events[0].event.id, events[1].id);
        assert_eq!(again.events[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn rejects_out_of_range_arguments() {
        let f = fixture();
        assert!(f.inbox.list(f.account, 0, None, None).await.is_err());
        assert!(f.inbox.list(f.account, 101, None, None).await.is_err());
        assert!(f.inbox.list(f.account, 10, Some(0), None).await.is_err());
        assert!(f.inbox.list(f.account, 10, Some(43_201), None).await.is_err());
        assert!(f.inbox.list(f.account, 10, None, Some("garbage!")).await.is_err());
    }
}
