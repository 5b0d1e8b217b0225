//! Dead letter queue management.
//!
//! Items are removed before their pairing is requeued, so a retry that
//! exhausts again simply writes a fresh item. Dismissal removes items and
//! cancels any task still queued for the pairing; both operations apply to
//! every item of the event when no subscription is named.

use std::sync::Arc;

use courier_core::{
    storage::{DlqPage, DlqQuery, DlqStats, OutcomeDelta, Storage},
    AccountId, Clock, CoreError, DlqItem, EventId, SubscriptionId,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::dispatcher::Wakeup;

/// Largest page `list` returns.
pub const MAX_PAGE_SIZE: usize = 100;

/// DLQ operation errors.
#[derive(Debug, Error)]
pub enum DlqError {
    /// Nothing in the DLQ matched the request.
    #[error("no dead letter queue items for event {event_id}")]
    ItemNotFound {
        /// Event that was asked for
        event_id: EventId,
    },

    /// Pagination or filter arguments are out of range.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] CoreError),
}

/// Result of a DLQ retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DlqRetryOutcome {
    /// Event whose deliveries were requeued.
    pub event_id: EventId,
    /// Subscriptions whose pairing went back on the queue.
    pub requeued: Vec<SubscriptionId>,
}

/// Operator actions over the dead letter queue.
#[derive(Debug, Clone)]
pub struct DlqManager {
    storage: Storage,
    clock: Arc<dyn Clock>,
    delivery_wakeup: Wakeup,
}

impl DlqManager {
    /// Creates a manager; `delivery_wakeup` is signalled after requeueing.
    pub fn new(storage: Storage, clock: Arc<dyn Clock>, delivery_wakeup: Wakeup) -> Self {
        Self { storage, clock, delivery_wakeup }
    }

    /// Lists the account's items newest first.
    ///
    /// # Errors
    ///
    /// Returns `DlqError::InvalidInput` for a zero or oversized page.
    pub async fn list(&self, account_id: AccountId, query: &DlqQuery) -> Result<DlqPage, DlqError> {
        if query.limit == 0 || query.limit > MAX_PAGE_SIZE {
            return Err(DlqError::InvalidInput(format!(
                "limit must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        Ok(self.storage.dead_letters.list(account_id, query).await?)
    }

    /// Summarizes the account's DLQ.
    pub async fn stats(&self, account_id: AccountId) -> Result<DlqStats, DlqError> {
        Ok(self.storage.dead_letters.stats(account_id).await?)
    }

    /// Puts dead-lettered pairings of `event_id` back on the queue.
    ///
    /// # Errors
    ///
    /// Returns `DlqError::ItemNotFound` when the account has no matching
    /// item.
    pub async fn retry(
        &self,
        account_id: AccountId,
        event_id: EventId,
        subscription_id: Option<SubscriptionId>,
    ) -> Result<DlqRetryOutcome, DlqError> {
        let removed =
            self.storage.dead_letters.remove(account_id, event_id, subscription_id).await?;
        if removed.is_empty() {
            return Err(DlqError::ItemNotFound { event_id });
        }

        let now = self.clock.now_utc();
        let mut requeued = Vec::with_capacity(removed.len());
        for item in removed {
            match self.storage.tasks.requeue(item.event_id, item.subscription_id, now).await? {
                Some(task) => {
                    self.storage.events.record_outcome(event_id, OutcomeDelta::reopened()).await?;
                    info!(
                        audit = true,
                        account_id = %account_id,
                        event_id = %event_id,
                        subscription_id = %item.subscription_id,
                        dlq_retries = task.dlq_retries,
                        "dead letter requeued"
                    );
                    requeued.push(item.subscription_id);
                },
                None => {
                    warn!(
                        event_id = %event_id,
                        subscription_id = %item.subscription_id,
                        "no dead task behind dead letter, restoring item"
                    );
                    self.restore(&item).await?;
                },
            }
        }

        if !requeued.is_empty() {
            self.delivery_wakeup.wake();
        }
        Ok(DlqRetryOutcome { event_id, requeued })
    }

    /// Removes dead-lettered pairings of `event_id` without retrying.
    ///
    /// # Errors
    ///
    /// Returns `DlqError::ItemNotFound` when the account has no matching
    /// item.
    pub async fn dismiss(
        &self,
        account_id: AccountId,
        event_id: EventId,
        subscription_id: Option<SubscriptionId>,
    ) -> Result<Vec<DlqItem>, DlqError> {
        let removed =
            self.storage.dead_letters.remove(account_id, event_id, subscription_id).await?;
        if removed.is_empty() {
            return Err(DlqError::ItemNotFound { event_id });
        }

        // Items only exist for dead or cancelled tasks, whose failure is
        // already counted; dismissing just drops the record.
        for item in &removed {
            info!(
                audit = true,
                account_id = %account_id,
                event_id = %event_id,
                subscription_id = %item.subscription_id,
                failure_reason = %item.failure_reason,
                "dead letter dismissed"
            );
        }
        Ok(removed)
    }

    async fn restore(&self, item: &DlqItem) -> Result<(), DlqError> {
        self.storage.dead_letters.upsert(item).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use courier_core::{
        storage::{DeadLetterRepository, EventRepository, TaskRepository},
        DeliveryTask, Event, EventMetadata, EventStatus, TaskStatus, TestClock,
    };
    use serde_json::json;

    use super::*;

    struct Fixture {
        storage: Storage,
        manager: DlqManager,
        wakeup: Wakeup,
        account: AccountId,
    }

    fn fixture() -> Fixture {
        let storage = Storage::in_memory();
        let wakeup = Wakeup::new();
        let manager = DlqManager::new(storage.clone(), Arc::new(TestClock::new()), wakeup.clone());
        Fixture { storage, manager, wakeup, account: AccountId::new() }
    }

    /// Stores a failed event with one dead task and its DLQ item.
    async fn dead_letter(f: &Fixture) -> (Event, SubscriptionId) {
        let now = Utc::now();
        let event =
            Event::new(f.account, "order.created", "shop", json!({}), EventMetadata::default(), now);
        f.storage.events.insert(&event).await.unwrap();
        f.storage.events.mark_dispatched(event.id, 1).await.unwrap();

        let subscription_id = SubscriptionId::new();
        let mut task = DeliveryTask::new(&event, subscription_id, now);
        task.status = TaskStatus::Dead;
        task.attempt_number = 3;
        f.storage.tasks.enqueue(&task).await.unwrap();
        f.storage.events.record_outcome(event.id, OutcomeDelta::dead_lettered()).await.unwrap();

        let item = DlqItem {
            event_id: event.id,
            subscription_id,
            account_id: f.account,
            event_type: event.event_type.clone(),
            source: event.source.clone(),
            failure_reason: "server error: HTTP 500".into(),
            retry_count: 0,
            created_at: now,
        };
        f.storage.dead_letters.upsert(&item).await.unwrap();
        (event, subscription_id)
    }

    #[tokio::test]
    async fn retry_requeues_the_pairing_and_reopens_the_event() {
        let f = fixture();
        let (event, subscription_id) = dead_letter(&f).await;

        let outcome = f.manager.retry(f.account, event.id, None).await.unwrap();
        assert_eq!(outcome.requeued, vec![subscription_id]);

        let task = f.storage.tasks.find_for_pair(event.id, subscription_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.attempt_number, 0);
        assert_eq!(task.dlq_retries, 1);

        let stored = EventRepository::find(&*f.storage.events, event.id).await.unwrap().unwrap();
        assert_eq!(stored.failed_deliveries, 0);
        assert_eq!(stored.status, EventStatus::Failed);

        let query = DlqQuery { limit: 10, ..DlqQuery::default() };
        let page = f.manager.list(f.account, &query).await.unwrap();
        assert_eq!(page.total, 0);
        tokio::time::timeout(std::time::Duration::from_secs(1), f.wakeup.notified()).await.unwrap();
    }

    #[tokio::test]
    async fn dismiss_removes_items_and_keeps_the_failure() {
        let f = fixture();
        let (event, _) = dead_letter(&f).await;

        let removed = f.manager.dismiss(f.account, event.id, None).await.unwrap();
        assert_eq!(removed.len(), 1);

        let stored = EventRepository::find(&*f.storage.events, event.id).await.unwrap().unwrap();
        assert_eq!(stored.failed_deliveries, 1);
        assert_eq!(stored.status, EventStatus::Failed);
        let tasks = f.storage.tasks.list_for_event(event.id).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Dead);
        assert!(matches!(
            f.manager.dismiss(f.account, event.id, None).await,
            Err(DlqError::ItemNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn other_accounts_cannot_touch_items() {
        let f = fixture();
        let (event, _) = dead_letter(&f).await;

        let stranger = AccountId::new();
        assert!(matches!(
            f.manager.retry(stranger, event.id, None).await,
            Err(DlqError::ItemNotFound { .. })
        ));
        assert_eq!(f.manager.stats(f.account).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn list_rejects_oversized_pages() {
        let f = fixture();
        let query = DlqQuery { limit: 101, ..DlqQuery::default() };
        assert!(matches!(
            f.manager.list(f.account, &query).await,
            Err(DlqError::InvalidInput(_))
        ));
    }
}
