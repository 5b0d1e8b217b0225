//! Visibility leases backing the polling inbox.
//!
//! A lease hides an event from other pollers until `visible_until`. Each
//! event has at most one lease row: leasing it again replaces the receipt
//! handle and bumps the delivery count. The row is deleted on acknowledge,
//! or by `purge_expired` once it lapsed and the event left the inbox.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{
    events::{EventCursor, EventRow, EVENT_COLUMNS},
    to_i64,
};
use crate::{
    error::Result,
    models::{new_receipt_handle, AccountId, Event, LeasedEvent},
};

/// Persistence for inbox leases.
#[async_trait]
pub trait InboxRepository: Send + Sync {
    /// Leases up to `limit` eligible events oldest first, skipping events
    /// with an open lease and events at or before `after`.
    async fn lease(
        &self,
        account_id: AccountId,
        after: Option<EventCursor>,
        limit: usize,
        visible_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<LeasedEvent>>;

    /// Acknowledges the event behind an open receipt handle.
    ///
    /// Returns `false` for unknown, foreign or lapsed handles.
    async fn acknowledge(
        &self,
        account_id: AccountId,
        receipt_handle: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Moves the end of an open lease.
    async fn change_visibility(
        &self,
        account_id: AccountId,
        receipt_handle: &str,
        visible_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Deletes lapsed leases of events that are no longer inbox-eligible.
    ///
    /// Leases of still-eligible events survive so their delivery count
    /// carries over to the next poll. Returns the number of rows removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// PostgreSQL inbox repository.
pub struct PgInboxRepository {
    pool: PgPool,
}

impl PgInboxRepository {
    /// Creates a repository over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct EventIdRow {
    id: uuid::Uuid,
}

#[async_trait]
impl InboxRepository for PgInboxRepository {
    async fn lease(
        &self,
        account_id: AccountId,
        after: Option<EventCursor>,
        limit: usize,
        visible_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<LeasedEvent>> {
        let mut tx = self.pool.begin().await?;

        let (after_at, after_id) = match after {
            Some(cursor) => (Some(cursor.created_at), Some(cursor.id.0)),
            None => (None, None),
        };

        let candidates: Vec<EventIdRow> = sqlx::query_as(
            r"
            SELECT e.id FROM events e
            WHERE e.account_id = $1
              AND e.acknowledged_at IS NULL
              AND (e.status IN ('pending', 'processing')
                   OR (e.status = 'delivered' AND e.matched_subscriptions = 0))
              AND ($2::timestamptz IS NULL OR (e.created_at, e.id) > ($2, $3))
              AND NOT EXISTS (
                  SELECT 1 FROM inbox_leases l
                  WHERE l.event_id = e.id AND l.visible_until > $4
              )
            ORDER BY e.created_at ASC, e.id ASC
            LIMIT $5
            FOR UPDATE OF e SKIP LOCKED
            ",
        )
        .bind(account_id.0)
        .bind(after_at)
        .bind(after_id)
        .bind(now)
        .bind(to_i64(limit))
        .fetch_all(&mut *tx)
        .await?;

        let mut leased = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let receipt_handle = new_receipt_handle();
            let delivery_count: i32 = sqlx::query_scalar(
                r"
                INSERT INTO inbox_leases (event_id, receipt_handle, account_id, visible_until, created_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (event_id) DO UPDATE SET
                    receipt_handle = EXCLUDED.receipt_handle,
                    visible_until = EXCLUDED.visible_until,
                    delivery_count = inbox_leases.delivery_count + 1
                RETURNING delivery_count
                ",
            )
            .bind(candidate.id)
            .bind(&receipt_handle)
            .bind(account_id.0)
            .bind(visible_until)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

            let row: EventRow =
                sqlx::query_as(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1"))
                    .bind(candidate.id)
                    .fetch_one(&mut *tx)
                    .await?;
            let event = Event::try_from(row)?;

            leased.push(LeasedEvent {
                event,
                receipt_handle,
                visible_until,
                delivery_count: u32::try_from(delivery_count).unwrap_or(u32::MAX),
            });
        }

        tx.commit().await?;
        Ok(leased)
    }

    async fn acknowledge(
        &self,
        account_id: AccountId,
        receipt_handle: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let event_id: Option<uuid::Uuid> = sqlx::query_scalar(
            r"
            SELECT event_id FROM inbox_leases
            WHERE receipt_handle = $1 AND account_id = $2 AND visible_until > $3
            FOR UPDATE
            ",
        )
        .bind(receipt_handle)
        .bind(account_id.0)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(event_id) = event_id else {
            tx.rollback().await?;
            return Ok(false);
        };

        sqlx::query(
            "UPDATE events SET acknowledged_at = $2 WHERE id = $1 AND acknowledged_at IS NULL",
        )
        .bind(event_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM inbox_leases WHERE event_id = $1")
            .bind(event_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn change_visibility(
        &self,
        account_id: AccountId,
        receipt_handle: &str,
        visible_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE inbox_leases SET visible_until = $3
            WHERE receipt_handle = $1 AND account_id = $2 AND visible_until > $4
            ",
        )
        .bind(receipt_handle)
        .bind(account_id.0)
        .bind(visible_until)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r"
            DELETE FROM inbox_leases l
            USING events e
            WHERE l.event_id = e.id
              AND l.visible_until <= $1
              AND NOT (
                  e.acknowledged_at IS NULL
                  AND (e.status IN ('pending', 'processing')
                       OR (e.status = 'delivered' AND e.matched_subscriptions = 0))
              )
            ",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
