//! Append-only audit trail of HTTP delivery calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{to_i32, to_u32};
use crate::{
    error::{CoreError, Result},
    models::{AttemptId, DeliveryAttempt, EventId, SubscriptionId},
};

/// Persistence for delivery attempts.
#[async_trait]
pub trait AttemptRepository: Send + Sync {
    /// Appends an attempt record.
    async fn record(&self, attempt: &DeliveryAttempt) -> Result<()>;

    /// Lists an event's attempts in the order they were made.
    async fn list_for_event(&self, event_id: EventId) -> Result<Vec<DeliveryAttempt>>;
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    id: Uuid,
    event_id: Uuid,
    subscription_id: Uuid,
    attempt_number: i32,
    outcome: String,
    status_code: Option<i32>,
    error_message: Option<String>,
    response_body: Option<String>,
    attempted_at: DateTime<Utc>,
    latency_ms: i64,
}

impl TryFrom<AttemptRow> for DeliveryAttempt {
    type Error = CoreError;

    fn try_from(row: AttemptRow) -> Result<Self> {
        Ok(Self {
            id: AttemptId(row.id),
            event_id: EventId(row.event_id),
            subscription_id: SubscriptionId(row.subscription_id),
            attempt_number: to_u32(row.attempt_number),
            outcome: row.outcome.parse()?,
            status_code: row.status_code.and_then(|code| u16::try_from(code).ok()),
            error_message: row.error_message,
            response_body: row.response_body,
            attempted_at: row.attempted_at,
            latency_ms: u64::try_from(row.latency_ms).unwrap_or(0),
        })
    }
}

/// PostgreSQL attempt repository.
pub struct PgAttemptRepository {
    pool: PgPool,
}

impl PgAttemptRepository {
    /// Creates a repository over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AttemptRepository for PgAttemptRepository {
    async fn record(&self, attempt: &DeliveryAttempt) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO delivery_attempts (
                id, event_id, subscription_id, attempt_number, outcome, status_code,
                error_message, response_body, attempted_at, latency_ms
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ",
        )
        .bind(attempt.id.0)
        .bind(attempt.event_id.0)
        .bind(attempt.subscription_id.0)
        .bind(to_i32(attempt.attempt_number))
        .bind(attempt.outcome.as_str())
        .bind(attempt.status_code.map(i32::from))
        .bind(attempt.error_message.as_deref())
        .bind(attempt.response_body.as_deref())
        .bind(attempt.attempted_at)
        .bind(i64::try_from(attempt.latency_ms).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_for_event(&self, event_id: EventId) -> Result<Vec<DeliveryAttempt>> {
        let rows: Vec<AttemptRow> = sqlx::query_as(
            r"
            SELECT id, event_id, subscription_id, attempt_number, outcome, status_code,
                   error_message, response_body, attempted_at, latency_ms
            FROM delivery_attempts
            WHERE event_id = $1
            ORDER BY attempted_at ASC, id ASC
            ",
        )
        .bind(event_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeliveryAttempt::try_from).collect()
    }
}
