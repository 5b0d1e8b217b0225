//! The delivery queue.
//!
//! One task exists per (event, subscription) pairing. Workers claim due
//! tasks under a lease and receive a fencing token; every state change a
//! worker makes afterwards must present that token, so a worker whose lease
//! lapsed and was reclaimed can no longer overwrite the new holder's result.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{to_i32, to_i64, to_u32};
use crate::{
    error::{CoreError, Result},
    models::{AccountId, DeliveryTask, EventId, SubscriptionId, TaskId},
};

/// Persistence for delivery tasks.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Inserts a task unless one already exists for the pairing.
    ///
    /// Returns `true` when the task was inserted.
    async fn enqueue(&self, task: &DeliveryTask) -> Result<bool>;

    /// Loads a task by id.
    async fn find(&self, id: TaskId) -> Result<Option<DeliveryTask>>;

    /// Loads the task for an (event, subscription) pairing.
    async fn find_for_pair(
        &self,
        event_id: EventId,
        subscription_id: SubscriptionId,
    ) -> Result<Option<DeliveryTask>>;

    /// Lists every task created for an event.
    async fn list_for_event(&self, event_id: EventId) -> Result<Vec<DeliveryTask>>;

    /// Leases up to `limit` due tasks.
    ///
    /// A task is due when it is queued with `next_attempt_at <= now`, or
    /// leased with an expired lease. Each claimed task gets a fresh
    /// `lease_token`.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryTask>>;

    /// Extends a lease still held under `token`.
    async fn renew_lease(&self, id: TaskId, token: Uuid, until: DateTime<Utc>) -> Result<bool>;

    /// Marks a leased task delivered after `attempt_number` attempts.
    async fn complete(
        &self,
        id: TaskId,
        token: Uuid,
        attempt_number: u32,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Releases a leased task for another attempt at `next_attempt_at`.
    async fn schedule_retry(
        &self,
        id: TaskId,
        token: Uuid,
        attempt_number: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Marks a leased task dead after its retry budget was exhausted.
    async fn mark_dead(
        &self,
        id: TaskId,
        token: Uuid,
        attempt_number: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Cancels a leased task without making an HTTP call.
    async fn cancel_leased(
        &self,
        id: TaskId,
        token: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Puts a dead or cancelled pairing back on the queue with a fresh
    /// retry budget.
    ///
    /// Returns the requeued task, or `None` when the pairing has no task in
    /// a requeueable state.
    async fn requeue(
        &self,
        event_id: EventId,
        subscription_id: SubscriptionId,
        now: DateTime<Utc>,
    ) -> Result<Option<DeliveryTask>>;
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    event_id: Uuid,
    subscription_id: Uuid,
    account_id: Uuid,
    attempt_number: i32,
    status: String,
    next_attempt_at: DateTime<Utc>,
    lease_until: Option<DateTime<Utc>>,
    lease_token: Option<Uuid>,
    last_error: Option<String>,
    dlq_retries: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for DeliveryTask {
    type Error = CoreError;

    fn try_from(row: TaskRow) -> Result<Self> {
        Ok(Self {
            id: TaskId(row.id),
            event_id: EventId(row.event_id),
            subscription_id: SubscriptionId(row.subscription_id),
            account_id: AccountId(row.account_id),
            attempt_number: to_u32(row.attempt_number),
            status: row.status.parse()?,
            next_attempt_at: row.next_attempt_at,
            lease_until: row.lease_until,
            lease_token: row.lease_token,
            last_error: row.last_error,
            dlq_retries: to_u32(row.dlq_retries),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const TASK_COLUMNS: &str = "id, event_id, subscription_id, account_id, attempt_number, status, \
     next_attempt_at, lease_until, lease_token, last_error, dlq_retries, created_at, updated_at";

fn decode_all(rows: Vec<TaskRow>) -> Result<Vec<DeliveryTask>> {
    rows.into_iter().map(DeliveryTask::try_from).collect()
}

/// PostgreSQL delivery queue.
pub struct PgTaskRepository {
    pool: PgPool,
}

impl PgTaskRepository {
    /// Creates a repository over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies a terminal or retry transition to a task still leased under
    /// `token`.
    #[allow(clippy::too_many_arguments)]
    async fn finish_leased(
        &self,
        id: TaskId,
        token: Uuid,
        status: &str,
        attempt_number: Option<u32>,
        next_attempt_at: Option<DateTime<Utc>>,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE delivery_tasks
            SET status = $3,
                attempt_number = COALESCE($4, attempt_number),
                next_attempt_at = COALESCE($5, next_attempt_at),
                last_error = COALESCE($6, last_error),
                lease_until = NULL,
                lease_token = NULL,
                updated_at = $7
            WHERE id = $1 AND lease_token = $2 AND status = 'leased'
            ",
        )
        .bind(id.0)
        .bind(token)
        .bind(status)
        .bind(attempt_number.map(to_i32))
        .bind(next_attempt_at)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl TaskRepository for PgTaskRepository {
    async fn enqueue(&self, task: &DeliveryTask) -> Result<bool> {
        let result = sqlx::query(
            r"
            INSERT INTO delivery_tasks (
                id, event_id, subscription_id, account_id, attempt_number, status,
                next_attempt_at, last_error, dlq_retries, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (event_id, subscription_id) DO NOTHING
            ",
        )
        .bind(task.id.0)
        .bind(task.event_id.0)
        .bind(task.subscription_id.0)
        .bind(task.account_id.0)
        .bind(to_i32(task.attempt_number))
        .bind(task.status.as_str())
        .bind(task.next_attempt_at)
        .bind(task.last_error.as_deref())
        .bind(to_i32(task.dlq_retries))
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn find(&self, id: TaskId) -> Result<Option<DeliveryTask>> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM delivery_tasks WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.map(DeliveryTask::try_from).transpose()
    }

    async fn find_for_pair(
        &self,
        event_id: EventId,
        subscription_id: SubscriptionId,
    ) -> Result<Option<DeliveryTask>> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM delivery_tasks WHERE event_id = $1 AND subscription_id = $2"
        ))
        .bind(event_id.0)
        .bind(subscription_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DeliveryTask::try_from).transpose()
    }

    async fn list_for_event(&self, event_id: EventId) -> Result<Vec<DeliveryTask>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM delivery_tasks WHERE event_id = $1 ORDER BY created_at, id"
        ))
        .bind(event_id.0)
        .fetch_all(&self.pool)
        .await?;

        decode_all(rows)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryTask>> {
        // gen_random_uuid() is evaluated per row, so every claim gets its
        // own fencing token.
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            r"
            UPDATE delivery_tasks
            SET status = 'leased', lease_until = $2, lease_token = gen_random_uuid(),
                updated_at = $1
            WHERE id IN (
                SELECT id FROM delivery_tasks
                WHERE (status = 'queued' AND next_attempt_at <= $1)
                   OR (status = 'leased' AND lease_until < $1)
                ORDER BY next_attempt_at ASC, id ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {TASK_COLUMNS}
            "
        ))
        .bind(now)
        .bind(lease_until)
        .bind(to_i64(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut tasks = decode_all(rows)?;
        tasks.sort_by_key(|t| (t.next_attempt_at, t.id));
        Ok(tasks)
    }

    async fn renew_lease(&self, id: TaskId, token: Uuid, until: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE delivery_tasks SET lease_until = $3
            WHERE id = $1 AND lease_token = $2 AND status = 'leased'
            ",
        )
        .bind(id.0)
        .bind(token)
        .bind(until)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete(
        &self,
        id: TaskId,
        token: Uuid,
        attempt_number: u32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.finish_leased(id, token, "completed", Some(attempt_number), None, None, now).await
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
        self.finish_leased(
            id,
            token,
            "queued",
            Some(attempt_number),
            Some(next_attempt_at),
            Some(error),
            now,
        )
        .await
    }

    async fn mark_dead(
        &self,
        id: TaskId,
        token: Uuid,
        attempt_number: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.finish_leased(id, token, "dead", Some(attempt_number), None, Some(error), now).await
    }

    async fn cancel_leased(
        &self,
        id: TaskId,
        token: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.finish_leased(id, token, "cancelled", None, None, Some(reason), now).await
    }

    async fn requeue(
        &self,
        event_id: EventId,
        subscription_id: SubscriptionId,
        now: DateTime<Utc>,
    ) -> Result<Option<DeliveryTask>> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            r"
            UPDATE delivery_tasks
            SET status = 'queued', attempt_number = 0, next_attempt_at = $3,
                lease_until = NULL, lease_token = NULL, dlq_retries = dlq_retries + 1,
                updated_at = $3
            WHERE event_id = $1 AND subscription_id = $2 AND status IN ('dead', 'cancelled')
            RETURNING {TASK_COLUMNS}
            "
        ))
        .bind(event_id.0)
        .bind(subscription_id.0)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DeliveryTask::try_from).transpose()
    }
}
