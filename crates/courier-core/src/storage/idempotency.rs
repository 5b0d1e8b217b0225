//! Idempotency key reservations, scoped per account.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::Result,
    models::{AccountId, EventId, IdempotencyRecord},
};

/// Result of trying to claim an idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// The key now maps to the caller's event.
    Reserved,
    /// An unexpired record already holds the key.
    Existing(IdempotencyRecord),
}

/// Persistence for idempotency keys.
#[async_trait]
pub trait IdempotencyRepository: Send + Sync {
    /// Returns the unexpired record for `key`, if any.
    async fn find(
        &self,
        account_id: AccountId,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>>;

    /// Claims the key for `record.event_id` unless an unexpired record holds
    /// it. Expired records are overwritten.
    async fn reserve(&self, record: &IdempotencyRecord, now: DateTime<Utc>) -> Result<Reservation>;

    /// Drops a reservation held by `event_id`, used when persisting the event
    /// failed.
    async fn release(&self, account_id: AccountId, key: &str, event_id: EventId) -> Result<()>;

    /// Deletes expired records, returning how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[derive(sqlx::FromRow)]
struct IdempotencyRow {
    account_id: Uuid,
    key: String,
    event_id: Uuid,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<IdempotencyRow> for IdempotencyRecord {
    fn from(row: IdempotencyRow) -> Self {
        Self {
            account_id: AccountId(row.account_id),
            key: row.key,
            event_id: EventId(row.event_id),
            expires_at: row.expires_at,
            created_at: row.created_at,
        }
    }
}

/// PostgreSQL idempotency repository.
pub struct PgIdempotencyRepository {
    pool: PgPool,
}

impl PgIdempotencyRepository {
    /// Creates a repository over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyRepository for PgIdempotencyRepository {
    async fn find(
        &self,
        account_id: AccountId,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>> {
        let row: Option<IdempotencyRow> = sqlx::query_as(
            r"
            SELECT account_id, key, event_id, expires_at, created_at
            FROM idempotency_keys
            WHERE account_id = $1 AND key = $2 AND expires_at > $3
            ",
        )
        .bind(account_id.0)
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn reserve(&self, record: &IdempotencyRecord, now: DateTime<Utc>) -> Result<Reservation> {
        // The upsert only overwrites expired rows, so at most one concurrent
        // caller gets a row back.
        let claimed: Option<Uuid> = sqlx::query_scalar(
            r"
            INSERT INTO idempotency_keys (account_id, key, event_id, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (account_id, key) DO UPDATE
            SET event_id = EXCLUDED.event_id,
                expires_at = EXCLUDED.expires_at,
                created_at = EXCLUDED.created_at
            WHERE idempotency_keys.expires_at <= $6
            RETURNING event_id
            ",
        )
        .bind(record.account_id.0)
        .bind(&record.key)
        .bind(record.event_id.0)
        .bind(record.expires_at)
        .bind(record.created_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(Reservation::Reserved);
        }

        match self.find(record.account_id, &record.key, now).await? {
            Some(existing) => Ok(Reservation::Existing(existing)),
            // holder expired between the two statements
            None => self.reserve(record, now).await,
        }
    }

    async fn release(&self, account_id: AccountId, key: &str, event_id: EventId) -> Result<()> {
        sqlx::query(
            "DELETE FROM idempotency_keys WHERE account_id = $1 AND key = $2 AND event_id = $3",
        )
        .bind(account_id.0)
        .bind(key)
        .bind(event_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
