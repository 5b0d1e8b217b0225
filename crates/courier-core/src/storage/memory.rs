//! In-process implementation of every repository.
//!
//! Backs tests and single-node development. All state sits behind one
//! `RwLock`, so each repository call is atomic with respect to the others,
//! which gives the same conditional-write guarantees the PostgreSQL queries
//! provide. [`MemoryStore::set_unavailable`] makes every call fail with a
//! database error for fault-injection tests, while
//! [`MemoryStore::set_rejecting_event_inserts`] and
//! [`MemoryStore::set_rejecting_dead_letters`] fail a single kind of write.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    attempts::AttemptRepository,
    credentials::CredentialRepository,
    dead_letters::{DeadLetterRepository, DlqPage, DlqQuery, DlqStats},
    events::{EventCursor, EventQuery, EventRepository, OutcomeDelta},
    idempotency::{IdempotencyRepository, Reservation},
    inbox::InboxRepository,
    rate_limits::RateLimitRepository,
    subscriptions::SubscriptionRepository,
    tasks::TaskRepository,
};
use crate::{
    error::{CoreError, Result},
    models::{
        new_receipt_handle, AccountId, Credential, DeliveryAttempt, DeliveryTask, DlqItem, Event,
        EventId, EventStatus, IdempotencyRecord, LeasedEvent, Subscription, SubscriptionId, TaskId,
        TaskStatus,
    },
    rate_limit::{BucketOutcome, RateLimitTier, TokenBucket},
};

struct InboxLease {
    receipt_handle: String,
    account_id: AccountId,
    visible_until: DateTime<Utc>,
    delivery_count: u32,
}

#[derive(Default)]
struct MemoryState {
    events: HashMap<EventId, Event>,
    idempotency: HashMap<(AccountId, String), IdempotencyRecord>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    tasks: HashMap<TaskId, DeliveryTask>,
    task_pairs: HashMap<(EventId, SubscriptionId), TaskId>,
    attempts: Vec<DeliveryAttempt>,
    dead_letters: HashMap<(EventId, SubscriptionId), DlqItem>,
    inbox_leases: HashMap<EventId, InboxLease>,
    receipt_handles: HashMap<String, EventId>,
    credentials: HashMap<String, Credential>,
    buckets: HashMap<String, TokenBucket>,
}

impl MemoryState {
    fn pair_task_mut(
        &mut self,
        event_id: EventId,
        subscription_id: SubscriptionId,
    ) -> Option<&mut DeliveryTask> {
        let id = self.task_pairs.get(&(event_id, subscription_id))?;
        self.tasks.get_mut(id)
    }

    fn leased_task_mut(&mut self, id: TaskId, token: Uuid) -> Option<&mut DeliveryTask> {
        self.tasks
            .get_mut(&id)
            .filter(|task| task.status == TaskStatus::Leased && task.lease_token == Some(token))
    }

    fn has_open_lease(&self, event_id: EventId, now: DateTime<Utc>) -> bool {
        self.inbox_leases.get(&event_id).is_some_and(|lease| lease.visible_until > now)
    }

    /// Event behind an unexpired receipt handle of `account_id`.
    fn open_lease_mut(
        &mut self,
        account_id: AccountId,
        receipt_handle: &str,
        now: DateTime<Utc>,
    ) -> Option<(EventId, &mut InboxLease)> {
        let event_id = *self.receipt_handles.get(receipt_handle)?;
        self.inbox_leases
            .get_mut(&event_id)
            .filter(|l| l.account_id == account_id && l.visible_until > now)
            .map(|lease| (event_id, lease))
    }

    fn drop_lease(&mut self, event_id: EventId) {
        if let Some(lease) = self.inbox_leases.remove(&event_id) {
            self.receipt_handles.remove(&lease.receipt_handle);
        }
    }
}

/// In-memory store implementing every repository trait.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    unavailable: AtomicBool,
    reject_event_inserts: AtomicBool,
    reject_dead_letters: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail (`true`) or succeed again (`false`).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes event inserts fail while every other call keeps working.
    pub fn set_rejecting_event_inserts(&self, reject: bool) {
        self.reject_event_inserts.store(reject, Ordering::SeqCst);
    }

    /// Makes DLQ writes fail while every other call keeps working.
    pub fn set_rejecting_dead_letters(&self, reject: bool) {
        self.reject_dead_letters.store(reject, Ordering::SeqCst);
    }

    /// Fails when the store has been marked unavailable.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` while unavailable.
    pub fn ping(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CoreError::Database("memory store unavailable".to_string()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("unavailable", &self.unavailable.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

fn event_not_found(id: EventId) -> CoreError {
    CoreError::NotFound(format!("event {id}"))
}

#[async_trait]
impl EventRepository for MemoryStore {
    async fn insert(&self, event: &Event) -> Result<()> {
        self.ping()?;
        if self.reject_event_inserts.load(Ordering::SeqCst) {
            return Err(CoreError::Database("event insert rejected".to_string()));
        }
        let mut state = self.state.write().await;
        if state.events.contains_key(&event.id) {
            return Err(CoreError::Conflict(format!("event {} already exists", event.id)));
        }
        state.events.insert(event.id, event.clone());
        Ok(())
    }

    async fn find(&self, id: EventId) -> Result<Option<Event>> {
        self.ping()?;
        Ok(self.state.read().await.events.get(&id).cloned())
    }

    async fn list(&self, account_id: AccountId, query: &EventQuery) -> Result<Vec<Event>> {
        self.ping()?;
        let state = self.state.read().await;
        let mut events: Vec<Event> = state
            .events
            .values()
            .filter(|e| e.account_id == account_id && query.accepts(e))
            .cloned()
            .collect();
        events.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        events.truncate(query.limit);
        Ok(events)
    }

    async fn claim_pending(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>> {
        self.ping()?;
        let mut state = self.state.write().await;
        let mut due: Vec<&mut Event> = state
            .events
            .values_mut()
            .filter(|e| {
                e.status == EventStatus::Pending
                    && e.dispatch_lease_until.is_none_or(|until| until <= now)
            })
            .collect();
        due.sort_by_key(|e| (e.created_at, e.id));

        Ok(due
            .into_iter()
            .take(limit)
            .map(|e| {
                e.dispatch_lease_until = Some(lease_until);
                e.clone()
            })
            .collect())
    }

    async fn mark_dispatched(&self, id: EventId, matched: u32) -> Result<Event> {
        self.ping()?;
        let mut state = self.state.write().await;
        let event = state.events.get_mut(&id).ok_or_else(|| event_not_found(id))?;
        if event.status == EventStatus::Pending {
            event.matched_subscriptions = matched;
            event.status =
                if matched == 0 { EventStatus::Delivered } else { EventStatus::Processing };
            event.dispatch_lease_until = None;
        }
        Ok(event.clone())
    }

    async fn record_outcome(&self, id: EventId, delta: OutcomeDelta) -> Result<Event> {
        self.ping()?;
        let mut state = self.state.write().await;
        let event = state.events.get_mut(&id).ok_or_else(|| event_not_found(id))?;
        delta.apply(event);
        Ok(event.clone())
    }

    async fn increment_replay_count(&self, id: EventId, cap: u32) -> Result<Option<u32>> {
        self.ping()?;
        let mut state = self.state.write().await;
        let event = state.events.get_mut(&id).ok_or_else(|| event_not_found(id))?;
        if event.replay_count >= cap {
            return Ok(None);
        }
        event.replay_count += 1;
        Ok(Some(event.replay_count))
    }

    async fn release_replay_slot(&self, id: EventId) -> Result<()> {
        self.ping()?;
        let mut state = self.state.write().await;
        let event = state.events.get_mut(&id).ok_or_else(|| event_not_found(id))?;
        event.replay_count = event.replay_count.saturating_sub(1);
        Ok(())
    }
}

#[async_trait]
impl IdempotencyRepository for MemoryStore {
    async fn find(
        &self,
        account_id: AccountId,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>> {
        self.ping()?;
        let state = self.state.read().await;
        Ok(state
            .idempotency
            .get(&(account_id, key.to_string()))
            .filter(|record| !record.is_expired(now))
            .cloned())
    }

    async fn reserve(&self, record: &IdempotencyRecord, now: DateTime<Utc>) -> Result<Reservation> {
        self.ping()?;
        let mut state = self.state.write().await;
        let slot = (record.account_id, record.key.clone());
        if let Some(existing) = state.idempotency.get(&slot) {
            if !existing.is_expired(now) {
                return Ok(Reservation::Existing(existing.clone()));
            }
        }
        state.idempotency.insert(slot, record.clone());
        Ok(Reservation::Reserved)
    }

    async fn release(&self, account_id: AccountId, key: &str, event_id: EventId) -> Result<()> {
        self.ping()?;
        let mut state = self.state.write().await;
        let slot = (account_id, key.to_string());
        if state.idempotency.get(&slot).is_some_and(|r| r.event_id == event_id) {
            state.idempotency.remove(&slot);
        }
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        self.ping()?;
        let mut state = self.state.write().await;
        let before = state.idempotency.len();
        state.idempotency.retain(|_, record| !record.is_expired(now));
        Ok((before - state.idempotency.len()) as u64)
    }
}

#[async_trait]
impl SubscriptionRepository for MemoryStore {
    async fn upsert(&self, subscription: &Subscription) -> Result<()> {
        self.ping()?;
        self.state.write().await.subscriptions.insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn find(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        self.ping()?;
        Ok(self.state.read().await.subscriptions.get(&id).cloned())
    }

    async fn list_active(&self, account_id: AccountId) -> Result<Vec<Subscription>> {
        self.ping()?;
        let state = self.state.read().await;
        let mut active: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|s| s.account_id == account_id && s.is_active())
            .cloned()
            .collect();
        active.sort_by_key(|s| (s.created_at, s.id));
        Ok(active)
    }

    async fn record_success(&self, id: SubscriptionId, now: DateTime<Utc>) -> Result<()> {
        self.ping()?;
        let mut state = self.state.write().await;
        let subscription = state
            .subscriptions
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("subscription {id}")))?;
        subscription.record_success(now);
        Ok(())
    }

    async fn record_failure(
        &self,
        id: SubscriptionId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.ping()?;
        let mut state = self.state.write().await;
        let subscription = state
            .subscriptions
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("subscription {id}")))?;
        Ok(subscription.record_failure(reason, now))
    }
}

#[async_trait]
impl TaskRepository for MemoryStore {
    async fn enqueue(&self, task: &DeliveryTask) -> Result<bool> {
        self.ping()?;
        let mut state = self.state.write().await;
        let pair = (task.event_id, task.subscription_id);
        if state.task_pairs.contains_key(&pair) {
            return Ok(false);
        }
        state.task_pairs.insert(pair, task.id);
        state.tasks.insert(task.id, task.clone());
        Ok(true)
    }

    async fn find(&self, id: TaskId) -> Result<Option<DeliveryTask>> {
        self.ping()?;
        Ok(self.state.read().await.tasks.get(&id).cloned())
    }

    async fn find_for_pair(
        &self,
        event_id: EventId,
        subscription_id: SubscriptionId,
    ) -> Result<Option<DeliveryTask>> {
        self.ping()?;
        let state = self.state.read().await;
        Ok(state
            .task_pairs
            .get(&(event_id, subscription_id))
            .and_then(|id| state.tasks.get(id))
            .cloned())
    }

    async fn list_for_event(&self, event_id: EventId) -> Result<Vec<DeliveryTask>> {
        self.ping()?;
        let state = self.state.read().await;
        let mut tasks: Vec<DeliveryTask> =
            state.tasks.values().filter(|t| t.event_id == event_id).cloned().collect();
        tasks.sort_by_key(|t| (t.created_at, t.id));
        Ok(tasks)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryTask>> {
        self.ping()?;
        let mut state = self.state.write().await;
        let mut due: Vec<&mut DeliveryTask> = state
            .tasks
            .values_mut()
            .filter(|t| match t.status {
                TaskStatus::Queued => t.next_attempt_at <= now,
                TaskStatus::Leased => t.lease_until.is_some_and(|until| until < now),
                _ => false,
            })
            .collect();
        due.sort_by_key(|t| (t.next_attempt_at, t.id));

        Ok(due
            .into_iter()
            .take(limit)
            .map(|t| {
                t.status = TaskStatus::Leased;
                t.lease_until = Some(lease_until);
                t.lease_token = Some(Uuid::new_v4());
                t.updated_at = now;
                t.clone()
            })
            .collect())
    }

    async fn renew_lease(&self, id: TaskId, token: Uuid, until: DateTime<Utc>) -> Result<bool> {
        self.ping()?;
        let mut state = self.state.write().await;
        Ok(state.leased_task_mut(id, token).map(|t| t.lease_until = Some(until)).is_some())
    }

    async fn complete(
        &self,
        id: TaskId,
        token: Uuid,
        attempt_number: u32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.ping()?;
        let mut state = self.state.write().await;
        Ok(state
            .leased_task_mut(id, token)
            .map(|t| {
                t.status = TaskStatus::Completed;
                t.attempt_number = attempt_number;
                t.lease_until = None;
                t.lease_token = None;
                t.updated_at = now;
            })
            .is_some())
    }

    async fn schedule_retry(
        &self,
        id: TaskId,
        token: Uuid,
        attempt_number: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.ping()?;
        let mut state = self.state.write().await;
        Ok(state
            .leased_task_mut(id, token)
            .map(|t| {
                t.status = TaskStatus::Queued;
                t.attempt_number = attempt_number;
                t.next_attempt_at = next_attempt_at;
                t.last_error = Some(error.to_string());
                t.lease_until = None;
                t.lease_token = None;
                t.updated_at = now;
            })
            .is_some())
    }

    async fn mark_dead(
        &self,
        id: TaskId,
        token: Uuid,
        attempt_number: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.ping()?;
        let mut state = self.state.write().await;
        Ok(state
            .leased_task_mut(id, token)
            .map(|t| {
                t.status = TaskStatus::Dead;
                t.attempt_number = attempt_number;
                t.last_error = Some(error.to_string());
                t.lease_until = None;
                t.lease_token = None;
                t.updated_at = now;
            })
            .is_some())
    }

    async fn cancel_leased(
        &self,
        id: TaskId,
        token: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.ping()?;
        let mut state = self.state.write().await;
        Ok(state
            .leased_task_mut(id, token)
            .map(|t| {
                t.status = TaskStatus::Cancelled;
                t.last_error = Some(reason.to_string());
                t.lease_until = None;
                t.lease_token = None;
                t.updated_at = now;
            })
            .is_some())
    }

    async fn requeue(
        &self,
        event_id: EventId,
        subscription_id: SubscriptionId,
        now: DateTime<Utc>,
    ) -> Result<Option<DeliveryTask>> {
        self.ping()?;
        let mut state = self.state.write().await;
        Ok(state
            .pair_task_mut(event_id, subscription_id)
            .filter(|t| matches!(t.status, TaskStatus::Dead | TaskStatus::Cancelled))
            .map(|t| {
                t.status = TaskStatus::Queued;
                t.attempt_number = 0;
                t.next_attempt_at = now;
                t.lease_until = None;
                t.lease_token = None;
                t.dlq_retries += 1;
                t.updated_at = now;
                t.clone()
            }))
    }
}

#[async_trait]
impl AttemptRepository for MemoryStore {
    async fn record(&self, attempt: &DeliveryAttempt) -> Result<()> {
        self.ping()?;
        self.state.write().await.attempts.push(attempt.clone());
        Ok(())
    }

    async fn list_for_event(&self, event_id: EventId) -> Result<Vec<DeliveryAttempt>> {
        self.ping()?;
        let state = self.state.read().await;
        Ok(state.attempts.iter().filter(|a| a.event_id == event_id).cloned().collect())
    }
}

#[async_trait]
impl DeadLetterRepository for MemoryStore {
    async fn upsert(&self, item: &DlqItem) -> Result<()> {
        self.ping()?;
        if self.reject_dead_letters.load(Ordering::SeqCst) {
            return Err(CoreError::Database("dead letter write rejected".to_string()));
        }
        let mut state = self.state.write().await;
        state.dead_letters.insert((item.event_id, item.subscription_id), item.clone());
        Ok(())
    }

    async fn list(&self, account_id: AccountId, query: &DlqQuery) -> Result<DlqPage> {
        self.ping()?;
        let state = self.state.read().await;
        let mut items: Vec<DlqItem> = state
            .dead_letters
            .values()
            .filter(|item| item.account_id == account_id && query.accepts(item))
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            (b.created_at, b.event_id, b.subscription_id).cmp(&(
                a.created_at,
                a.event_id,
                a.subscription_id,
            ))
        });

        let total = items.len() as u64;
        let items = items.into_iter().skip(query.offset).take(query.limit).collect();
        Ok(DlqPage { items, total })
    }

    async fn remove(
        &self,
        account_id: AccountId,
        event_id: EventId,
        subscription_id: Option<SubscriptionId>,
    ) -> Result<Vec<DlqItem>> {
        self.ping()?;
        let mut state = self.state.write().await;
        let keys: Vec<(EventId, SubscriptionId)> = state
            .dead_letters
            .values()
            .filter(|item| {
                item.account_id == account_id
                    && item.event_id == event_id
                    && subscription_id.is_none_or(|id| item.subscription_id == id)
            })
            .map(|item| (item.event_id, item.subscription_id))
            .collect();

        let mut removed: Vec<DlqItem> =
            keys.iter().filter_map(|key| state.dead_letters.remove(key)).collect();
        removed.sort_by_key(|item| item.subscription_id);
        Ok(removed)
    }

    async fn stats(&self, account_id: AccountId) -> Result<DlqStats> {
        self.ping()?;
        let state = self.state.read().await;
        let mut stats = DlqStats::default();
        for item in state.dead_letters.values().filter(|item| item.account_id == account_id) {
            stats.total += 1;
            *stats.by_event_type.entry(item.event_type.clone()).or_default() += 1;
            stats.oldest =
                Some(stats.oldest.map_or(item.created_at, |oldest| oldest.min(item.created_at)));
        }
        Ok(stats)
    }
}

#[async_trait]
impl InboxRepository for MemoryStore {
    async fn lease(
        &self,
        account_id: AccountId,
        after: Option<EventCursor>,
        limit: usize,
        visible_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<LeasedEvent>> {
        self.ping()?;
        let mut state = self.state.write().await;

        let mut candidates: Vec<Event> = state
            .events
            .values()
            .filter(|e| {
                e.account_id == account_id
                    && e.is_inbox_eligible()
                    && after.is_none_or(|c| (e.created_at, e.id) > (c.created_at, c.id))
            })
            .filter(|e| !state.has_open_lease(e.id, now))
            .cloned()
            .collect();
        candidates.sort_by_key(|e| (e.created_at, e.id));
        candidates.truncate(limit);

        let mut leased = Vec::with_capacity(candidates.len());
        for event in candidates {
            let receipt_handle = new_receipt_handle();
            let delivery_count = state.inbox_leases.get(&event.id).map_or(0, |l| l.delivery_count) + 1;
            state.drop_lease(event.id);
            state.receipt_handles.insert(receipt_handle.clone(), event.id);
            state.inbox_leases.insert(
                event.id,
                InboxLease {
                    receipt_handle: receipt_handle.clone(),
                    account_id,
                    visible_until,
                    delivery_count,
                },
            );
            leased.push(LeasedEvent { event, receipt_handle, visible_until, delivery_count });
        }
        Ok(leased)
    }

    async fn acknowledge(
        &self,
        account_id: AccountId,
        receipt_handle: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.ping()?;
        let mut state = self.state.write().await;
        let Some((event_id, _)) = state.open_lease_mut(account_id, receipt_handle, now) else {
            return Ok(false);
        };

        if let Some(event) = state.events.get_mut(&event_id) {
            event.acknowledged_at.get_or_insert(now);
        }
        state.drop_lease(event_id);
        Ok(true)
    }

    async fn change_visibility(
        &self,
        account_id: AccountId,
        receipt_handle: &str,
        visible_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.ping()?;
        let mut state = self.state.write().await;
        Ok(state
            .open_lease_mut(account_id, receipt_handle, now)
            .map(|(_, lease)| lease.visible_until = visible_until)
            .is_some())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        self.ping()?;
        let mut state = self.state.write().await;
        let stale: Vec<EventId> = state
            .inbox_leases
            .iter()
            .filter(|(event_id, lease)| {
                lease.visible_until <= now
                    && !state.events.get(event_id).is_some_and(Event::is_inbox_eligible)
            })
            .map(|(event_id, _)| *event_id)
            .collect();
        for event_id in &stale {
            state.drop_lease(*event_id);
        }
        Ok(stale.len() as u64)
    }
}

#[async_trait]
impl CredentialRepository for MemoryStore {
    async fn upsert(&self, credential: &Credential) -> Result<()> {
        self.ping()?;
        let mut state = self.state.write().await;
        state.credentials.insert(credential.key_hash.clone(), credential.clone());
        Ok(())
    }

    async fn find_by_key_hash(&self, key_hash: &str) -> Result<Option<Credential>> {
        self.ping()?;
        let state = self.state.read().await;
        Ok(state.credentials.get(key_hash).filter(|c| c.revoked_at.is_none()).cloned())
    }
}

#[async_trait]
impl RateLimitRepository for MemoryStore {
    async fn take(
        &self,
        key: &str,
        tier: RateLimitTier,
        now: DateTime<Utc>,
    ) -> Result<BucketOutcome> {
        self.ping()?;
        let mut state = self.state.write().await;
        let bucket =
            state.buckets.entry(key.to_string()).or_insert_with(|| TokenBucket::full(tier, now));
        Ok(bucket.take(tier, now))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;
    use crate::models::{EventFilter, EventMetadata};

    fn event(account_id: AccountId) -> Event {
        Event::new(account_id, "order.created", "shop", json!({}), EventMetadata::default(), Utc::now())
    }

    #[tokio::test]
    async fn idempotency_reservation_is_exclusive_until_expiry() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let account = AccountId::new();
        let first = IdempotencyRecord {
            account_id: account,
            key: "k".into(),
            event_id: EventId::new(),
            expires_at: now + Duration::hours(24),
            created_at: now,
        };
        let second = IdempotencyRecord { event_id: EventId::new(), ..first.clone() };

        assert_eq!(store.reserve(&first, now).await.unwrap(), Reservation::Reserved);
        assert_eq!(store.reserve(&second, now).await.unwrap(), Reservation::Existing(first.clone()));

        // other accounts are independent
        let foreign = IdempotencyRecord { account_id: AccountId::new(), ..second.clone() };
        assert_eq!(store.reserve(&foreign, now).await.unwrap(), Reservation::Reserved);

        let later = now + Duration::hours(25);
        assert_eq!(store.reserve(&second, later).await.unwrap(), Reservation::Reserved);
        assert_eq!(IdempotencyRepository::purge_expired(&store, later + Duration::hours(25)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn release_only_drops_own_reservation() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let record = IdempotencyRecord {
            account_id: AccountId::new(),
            key: "k".into(),
            event_id: EventId::new(),
            expires_at: now + Duration::hours(1),
            created_at: now,
        };
        store.reserve(&record, now).await.unwrap();

        store.release(record.account_id, "k", EventId::new()).await.unwrap();
        assert!(IdempotencyRepository::find(&store, record.account_id, "k", now)
            .await
            .unwrap()
            .is_some());

        store.release(record.account_id, "k", record.event_id).await.unwrap();
        assert!(IdempotencyRepository::find(&store, record.account_id, "k", now)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn stale_lease_token_cannot_finish_a_reclaimed_task() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let event = event(AccountId::new());
        let task = DeliveryTask::new(&event, SubscriptionId::new(), now);
        assert!(store.enqueue(&task).await.unwrap());
        assert!(!store.enqueue(&DeliveryTask::new(&event, task.subscription_id, now)).await.unwrap());

        let first = store.claim_due(now, now + Duration::seconds(30), 10).await.unwrap();
        let stale = first[0].lease_token.unwrap();
        assert!(store.claim_due(now, now + Duration::seconds(30), 10).await.unwrap().is_empty());

        let later = now + Duration::seconds(31);
        let second = store.claim_due(later, later + Duration::seconds(30), 10).await.unwrap();
        let fresh = second[0].lease_token.unwrap();
        assert_ne!(stale, fresh);

        assert!(!store.complete(task.id, stale, 1, later).await.unwrap());
        assert!(store.complete(task.id, fresh, 1, later).await.unwrap());
        let done = TaskRepository::find(&store, task.id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn requeue_resets_dead_task_budget() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let event = event(AccountId::new());
        let task = DeliveryTask::new(&event, SubscriptionId::new(), now);
        store.enqueue(&task).await.unwrap();

        assert!(store.requeue(event.id, task.subscription_id, now).await.unwrap().is_none());

        let claimed = store.claim_due(now, now + Duration::seconds(30), 1).await.unwrap();
        let token = claimed[0].lease_token.unwrap();
        assert!(store.mark_dead(task.id, token, 3, "HTTP 500", now).await.unwrap());

        let requeued = store.requeue(event.id, task.subscription_id, now).await.unwrap().unwrap();
        assert_eq!(requeued.status, TaskStatus::Queued);
        assert_eq!(requeued.attempt_number, 0);
        assert_eq!(requeued.dlq_retries, 1);
    }

    #[tokio::test]
    async fn claim_pending_hides_claimed_events_until_lease_lapses() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let event = event(AccountId::new());
        store.insert(&event).await.unwrap();

        assert_eq!(store.claim_pending(now, now + Duration::seconds(30), 10).await.unwrap().len(), 1);
        assert!(store.claim_pending(now, now + Duration::seconds(30), 10).await.unwrap().is_empty());

        let later = now + Duration::seconds(30);
        assert_eq!(store.claim_pending(later, later, 10).await.unwrap().len(), 1);

        let dispatched = store.mark_dispatched(event.id, 0).await.unwrap();
        assert_eq!(dispatched.status, EventStatus::Delivered);
        assert!(store.claim_pending(later, later, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replay_counter_stops_at_cap() {
        let store = MemoryStore::new();
        let event = event(AccountId::new());
        store.insert(&event).await.unwrap();

        assert_eq!(store.increment_replay_count(event.id, 2).await.unwrap(), Some(1));
        assert_eq!(store.increment_replay_count(event.id, 2).await.unwrap(), Some(2));
        assert_eq!(store.increment_replay_count(event.id, 2).await.unwrap(), None);

        store.release_replay_slot(event.id).await.unwrap();
        assert_eq!(store.increment_replay_count(event.id, 2).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn subscriptions_disable_after_threshold() {
        let store = MemoryStore::new();
        let account = AccountId::new();
        let mut subscription =
            Subscription::new(account, "https://example.com", "s", EventFilter::default(), Utc::now());
        subscription.failure_threshold = 2;
        SubscriptionRepository::upsert(&store, &subscription).await.unwrap();

        assert!(!store.record_failure(subscription.id, "HTTP 500", Utc::now()).await.unwrap());
        assert!(store.record_failure(subscription.id, "HTTP 500", Utc::now()).await.unwrap());
        assert!(store.list_active(account).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dlq_remove_without_subscription_takes_every_item() {
        let store = MemoryStore::new();
        let account = AccountId::new();
        let event_id = EventId::new();
        for _ in 0..2 {
            DeadLetterRepository::upsert(
                &store,
                &DlqItem {
                    event_id,
                    subscription_id: SubscriptionId::new(),
                    account_id: account,
                    event_type: "order.created".into(),
                    source: "shop".into(),
                    failure_reason: "HTTP 500".into(),
                    retry_count: 0,
                    created_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        }

        let stats = store.stats(account).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_event_type.get("order.created"), Some(&2));

        assert!(store.remove(AccountId::new(), event_id, None).await.unwrap().is_empty());
        assert_eq!(store.remove(account, event_id, None).await.unwrap().len(), 2);
        assert_eq!(store.stats(account).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);

        assert!(store.ping().is_err());
        assert!(matches!(
            EventRepository::find(&store, EventId::new()).await,
            Err(CoreError::Database(_))
        ));

        store.set_unavailable(false);
        assert!(store.ping().is_ok());
    }
}
