//! Event store: append-only event records plus their delivery counters.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use super::{to_i32, to_i64, to_u32};
use crate::{
    error::{CoreError, Result},
    models::{AccountId, Event, EventId, EventMetadata, EventStatus, SubscriptionId},
};

/// Position in the `(created_at, id)` ordering of an account's events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCursor {
    /// Creation time of the boundary event.
    pub created_at: DateTime<Utc>,
    /// Identifier of the boundary event.
    pub id: EventId,
}

impl EventCursor {
    /// Cursor positioned at `event`.
    pub fn of(event: &Event) -> Self {
        Self { created_at: event.created_at, id: event.id }
    }

    /// Encodes the cursor as an opaque URL-safe token.
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Decodes a token produced by [`EventCursor::encode`].
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` for malformed tokens.
    pub fn decode(token: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| CoreError::InvalidInput("invalid cursor".to_string()))?;
        serde_json::from_slice(&bytes)
            .map_err(|_| CoreError::InvalidInput("invalid cursor".to_string()))
    }

    fn key(&self) -> (DateTime<Utc>, EventId) {
        (self.created_at, self.id)
    }
}

/// Filters for listing an account's events, newest first.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Exact event type.
    pub event_type: Option<String>,
    /// Exact source.
    pub source: Option<String>,
    /// Delivery status.
    pub status: Option<EventStatus>,
    /// Inclusive lower bound on `created_at`.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`.
    pub until: Option<DateTime<Utc>>,
    /// Only events strictly older than this position.
    pub before: Option<EventCursor>,
    /// Maximum number of events returned.
    pub limit: usize,
}

impl EventQuery {
    /// Returns whether `event` passes every filter except the limit.
    pub fn accepts(&self, event: &Event) -> bool {
        self.event_type.as_deref().is_none_or(|t| event.event_type == t)
            && self.source.as_deref().is_none_or(|s| event.source == s)
            && self.status.is_none_or(|s| event.status == s)
            && self.since.is_none_or(|since| event.created_at >= since)
            && self.until.is_none_or(|until| event.created_at < until)
            && self.before.is_none_or(|c| (event.created_at, event.id) < c.key())
    }
}

/// Counter changes applied when a delivery resolves or reopens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeDelta {
    /// HTTP calls made.
    pub attempts: u32,
    /// Change to `successful_deliveries`.
    pub successful: i32,
    /// Change to `failed_deliveries`.
    pub failed: i32,
}

impl OutcomeDelta {
    /// A failed attempt that will be retried.
    pub const fn retrying() -> Self {
        Self { attempts: 1, successful: 0, failed: 0 }
    }

    /// A successful attempt.
    pub const fn delivered() -> Self {
        Self { attempts: 1, successful: 1, failed: 0 }
    }

    /// A failed attempt that exhausted the retry budget.
    pub const fn dead_lettered() -> Self {
        Self { attempts: 1, successful: 0, failed: 1 }
    }

    /// A pairing resolved as failed without an HTTP call.
    pub const fn cancelled() -> Self {
        Self { attempts: 0, successful: 0, failed: 1 }
    }

    /// A dead-lettered pairing put back in flight by an operator.
    pub const fn reopened() -> Self {
        Self { attempts: 0, successful: 0, failed: -1 }
    }

    /// Applies the delta to `event`, recomputing its status.
    pub fn apply(&self, event: &mut Event) {
        event.delivery_attempts = event.delivery_attempts.saturating_add(self.attempts);
        event.successful_deliveries = add_signed(event.successful_deliveries, self.successful);
        event.failed_deliveries = add_signed(event.failed_deliveries, self.failed);
        if event.status != EventStatus::Pending {
            event.status = EventStatus::from_counts(
                event.status,
                event.matched_subscriptions,
                event.successful_deliveries,
                event.failed_deliveries,
            );
        }
    }
}

fn add_signed(value: u32, delta: i32) -> u32 {
    if delta >= 0 {
        value.saturating_add(delta.unsigned_abs())
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

/// Persistence for events.
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Stores a newly accepted event.
    async fn insert(&self, event: &Event) -> Result<()>;

    /// Loads an event by id.
    async fn find(&self, id: EventId) -> Result<Option<Event>>;

    /// Lists an account's events newest first.
    async fn list(&self, account_id: AccountId, query: &EventQuery) -> Result<Vec<Event>>;

    /// Claims up to `limit` pending events for dispatch, oldest first.
    ///
    /// Claimed events are hidden from other dispatchers until
    /// `lease_until`.
    async fn claim_pending(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>>;

    /// Records the dispatch result: `processing` when subscriptions matched,
    /// `delivered` otherwise. A no-op for events that left `pending`.
    async fn mark_dispatched(&self, id: EventId, matched: u32) -> Result<Event>;

    /// Atomically applies counter changes and recomputes the status.
    async fn record_outcome(&self, id: EventId, delta: OutcomeDelta) -> Result<Event>;

    /// Increments the replay counter unless it already reached `cap`.
    ///
    /// Returns the new count, or `None` when the cap is reached.
    async fn increment_replay_count(&self, id: EventId, cap: u32) -> Result<Option<u32>>;

    /// Gives back one replay taken by `increment_replay_count` whose replay
    /// event was never stored. Never drops the counter below zero.
    async fn release_replay_slot(&self, id: EventId) -> Result<()>;
}

#[derive(sqlx::FromRow)]
pub(crate) struct EventRow {
    id: Uuid,
    account_id: Uuid,
    event_type: String,
    source: String,
    data: Value,
    metadata: Value,
    status: String,
    created_at: DateTime<Utc>,
    delivery_attempts: i32,
    successful_deliveries: i32,
    failed_deliveries: i32,
    matched_subscriptions: i32,
    replay_count: i32,
    replay_of: Option<Uuid>,
    target_subscriptions: Option<Vec<Uuid>>,
    acknowledged_at: Option<DateTime<Utc>>,
    dispatch_lease_until: Option<DateTime<Utc>>,
}

impl TryFrom<EventRow> for Event {
    type Error = CoreError;

    fn try_from(row: EventRow) -> Result<Self> {
        let metadata: EventMetadata = serde_json::from_value(row.metadata)?;
        Ok(Self {
            id: EventId(row.id),
            account_id: AccountId(row.account_id),
            event_type: row.event_type,
            source: row.source,
            data: row.data,
            metadata,
            status: row.status.parse()?,
            created_at: row.created_at,
            delivery_attempts: to_u32(row.delivery_attempts),
            successful_deliveries: to_u32(row.successful_deliveries),
            failed_deliveries: to_u32(row.failed_deliveries),
            matched_subscriptions: to_u32(row.matched_subscriptions),
            replay_count: to_u32(row.replay_count),
            replay_of: row.replay_of.map(EventId),
            target_subscriptions: row
                .target_subscriptions
                .map(|ids| ids.into_iter().map(SubscriptionId).collect()),
            acknowledged_at: row.acknowledged_at,
            dispatch_lease_until: row.dispatch_lease_until,
        })
    }
}

pub(crate) const EVENT_COLUMNS: &str = "id, account_id, event_type, source, data, metadata, \
     status, created_at, delivery_attempts, successful_deliveries, failed_deliveries, \
     matched_subscriptions, replay_count, replay_of, target_subscriptions, acknowledged_at, \
     dispatch_lease_until";

fn decode_all(rows: Vec<EventRow>) -> Result<Vec<Event>> {
    rows.into_iter().map(Event::try_from).collect()
}

/// PostgreSQL event repository.
pub struct PgEventRepository {
    pool: PgPool,
}

impl PgEventRepository {
    /// Creates a repository over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventRepository for PgEventRepository {
    async fn insert(&self, event: &Event) -> Result<()> {
        let targets: Option<Vec<Uuid>> =
            event.target_subscriptions.as_ref().map(|ids| ids.iter().map(|id| id.0).collect());

        sqlx::query(
            r"
            INSERT INTO events (
                id, account_id, event_type, source, data, metadata, status, created_at,
                delivery_attempts, successful_deliveries, failed_deliveries,
                matched_subscriptions, replay_count, replay_of, target_subscriptions
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ",
        )
        .bind(event.id.0)
        .bind(event.account_id.0)
        .bind(&event.event_type)
        .bind(&event.source)
        .bind(&event.data)
        .bind(serde_json::to_value(&event.metadata)?)
        .bind(event.status.as_str())
        .bind(event.created_at)
        .bind(to_i32(event.delivery_attempts))
        .bind(to_i32(event.successful_deliveries))
        .bind(to_i32(event.failed_deliveries))
        .bind(to_i32(event.matched_subscriptions))
        .bind(to_i32(event.replay_count))
        .bind(event.replay_of.map(|id| id.0))
        .bind(targets)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find(&self, id: EventId) -> Result<Option<Event>> {
        let row: Option<EventRow> =
            sqlx::query_as(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.map(Event::try_from).transpose()
    }

    async fn list(&self, account_id: AccountId, query: &EventQuery) -> Result<Vec<Event>> {
        let (before_at, before_id) = match query.before {
            Some(cursor) => (Some(cursor.created_at), Some(cursor.id.0)),
            None => (None, None),
        };

        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            r"
            SELECT {EVENT_COLUMNS} FROM events
            WHERE account_id = $1
              AND ($2::text IS NULL OR event_type = $2)
              AND ($3::text IS NULL OR source = $3)
              AND ($4::text IS NULL OR status = $4)
              AND ($5::timestamptz IS NULL OR created_at >= $5)
              AND ($6::timestamptz IS NULL OR created_at < $6)
              AND ($7::timestamptz IS NULL OR (created_at, id) < ($7, $8))
            ORDER BY created_at DESC, id DESC
            LIMIT $9
            "
        ))
        .bind(account_id.0)
        .bind(query.event_type.as_deref())
        .bind(query.source.as_deref())
        .bind(query.status.map(|s| s.as_str()))
        .bind(query.since)
        .bind(query.until)
        .bind(before_at)
        .bind(before_id)
        .bind(to_i64(query.limit))
        .fetch_all(&self.pool)
        .await?;

        decode_all(rows)
    }

    async fn claim_pending(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            r"
            UPDATE events SET dispatch_lease_until = $2
            WHERE id IN (
                SELECT id FROM events
                WHERE status = 'pending'
                  AND (dispatch_lease_until IS NULL OR dispatch_lease_until <= $1)
                ORDER BY created_at ASC, id ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {EVENT_COLUMNS}
            "
        ))
        .bind(now)
        .bind(lease_until)
        .bind(to_i64(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut events = decode_all(rows)?;
        events.sort_by_key(|e| (e.created_at, e.id));
        Ok(events)
    }

    async fn mark_dispatched(&self, id: EventId, matched: u32) -> Result<Event> {
        let row: Option<EventRow> = sqlx::query_as(&format!(
            r"
            UPDATE events
            SET matched_subscriptions = $2,
                status = CASE WHEN $2 = 0 THEN 'delivered' ELSE 'processing' END,
                dispatch_lease_until = NULL
            WHERE id = $1 AND status = 'pending'
            RETURNING {EVENT_COLUMNS}
            "
        ))
        .bind(id.0)
        .bind(to_i32(matched))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Event::try_from(row),
            None => self
                .find(id)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("event {id}"))),
        }
    }

    async fn record_outcome(&self, id: EventId, delta: OutcomeDelta) -> Result<Event> {
        let mut tx = self.pool.begin().await?;

        let row: Option<EventRow> =
            sqlx::query_as(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1 FOR UPDATE"))
                .bind(id.0)
                .fetch_optional(&mut *tx)
                .await?;
        let mut event = row
            .map(Event::try_from)
            .transpose()?
            .ok_or_else(|| CoreError::NotFound(format!("event {id}")))?;

        delta.apply(&mut event);

        sqlx::query(
            r"
            UPDATE events
            SET delivery_attempts = $2, successful_deliveries = $3,
                failed_deliveries = $4, status = $5
            WHERE id = $1
            ",
        )
        .bind(id.0)
        .bind(to_i32(event.delivery_attempts))
        .bind(to_i32(event.successful_deliveries))
        .bind(to_i32(event.failed_deliveries))
        .bind(event.status.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(event)
    }

    async fn increment_replay_count(&self, id: EventId, cap: u32) -> Result<Option<u32>> {
        let count: Option<i32> = sqlx::query_scalar(
            r"
            UPDATE events SET replay_count = replay_count + 1
            WHERE id = $1 AND replay_count < $2
            RETURNING replay_count
            ",
        )
        .bind(id.0)
        .bind(to_i32(cap))
        .fetch_optional(&self.pool)
        .await?;

        Ok(count.map(to_u32))
    }

    async fn release_replay_slot(&self, id: EventId) -> Result<()> {
        sqlx::query("UPDATE events SET replay_count = replay_count - 1 WHERE id = $1 AND replay_count > 0")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn event_at(secs: i64) -> Event {
        let at = Utc.timestamp_opt(secs, 0).single().unwrap();
        Event::new(AccountId::new(), "order.created", "shop", json!({}), EventMetadata::default(), at)
    }

    #[test]
    fn cursor_round_trips_and_rejects_garbage() {
        let event = event_at(1_700_000_000);
        let cursor = EventCursor::of(&event);

        assert_eq!(EventCursor::decode(&cursor.encode()).unwrap(), cursor);
        assert!(EventCursor::decode("not base64!").is_err());
        assert!(EventCursor::decode(&URL_SAFE_NO_PAD.encode(b"{}")).is_err());
    }

    #[test]
    fn query_filters_by_cursor_and_window() {
        let older = event_at(100);
        let newer = event_at(200);
        let query = EventQuery { before: Some(EventCursor::of(&newer)), ..EventQuery::default() };

        assert!(query.accepts(&older));
        assert!(!query.accepts(&newer));

        let window = EventQuery {
            since: Some(Utc.timestamp_opt(150, 0).single().unwrap()),
            ..EventQuery::default()
        };
        assert!(!window.accepts(&older));
        assert!(window.accepts(&newer));
    }

    #[test]
    fn outcome_delta_recomputes_status() {
        let mut event = event_at(0);
        event.status = EventStatus::Processing;
        event.matched_subscriptions = 2;

        OutcomeDelta::retrying().apply(&mut event);
        assert_eq!(event.status, EventStatus::Processing);
        assert_eq!(event.delivery_attempts, 1);

        OutcomeDelta::delivered().apply(&mut event);
        OutcomeDelta::dead_lettered().apply(&mut event);
        assert_eq!(event.status, EventStatus::PartiallyDelivered);
        assert_eq!(event.delivery_attempts, 3);

        OutcomeDelta::reopened().apply(&mut event);
        assert_eq!(event.status, EventStatus::PartiallyDelivered);
        assert_eq!(event.failed_deliveries, 0);

        OutcomeDelta::delivered().apply(&mut event);
        assert_eq!(event.status, EventStatus::Delivered);
    }
}
