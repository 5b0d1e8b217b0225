//! Webhook subscriptions and their delivery health.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{to_i32, to_u32};
use crate::{
    error::{CoreError, Result},
    models::{AccountId, EventFilter, RetryPolicy, Subscription, SubscriptionId},
};

/// Persistence for subscriptions.
#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    /// Inserts or replaces a subscription.
    async fn upsert(&self, subscription: &Subscription) -> Result<()>;

    /// Loads a subscription by id.
    async fn find(&self, id: SubscriptionId) -> Result<Option<Subscription>>;

    /// Lists an account's active subscriptions, oldest first.
    async fn list_active(&self, account_id: AccountId) -> Result<Vec<Subscription>>;

    /// Resets failure tracking after a delivery succeeded.
    async fn record_success(&self, id: SubscriptionId, now: DateTime<Utc>) -> Result<()>;

    /// Counts a failed delivery. Returns `true` when the failure disabled
    /// the subscription.
    async fn record_failure(
        &self,
        id: SubscriptionId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    account_id: Uuid,
    name: String,
    url: String,
    filter: Value,
    retry_policy: Value,
    signing_secret: String,
    status: String,
    timeout_seconds: i32,
    custom_headers: Value,
    consecutive_failures: i32,
    failure_threshold: i32,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    last_failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = CoreError;

    fn try_from(row: SubscriptionRow) -> Result<Self> {
        let filter: EventFilter = serde_json::from_value(row.filter)?;
        let retry_policy: RetryPolicy = serde_json::from_value(row.retry_policy)?;
        let custom_headers: BTreeMap<String, String> = serde_json::from_value(row.custom_headers)?;

        Ok(Self {
            id: SubscriptionId(row.id),
            account_id: AccountId(row.account_id),
            name: row.name,
            url: row.url,
            filter,
            retry_policy,
            signing_secret: row.signing_secret,
            status: row.status.parse()?,
            timeout_seconds: to_u32(row.timeout_seconds),
            custom_headers,
            consecutive_failures: to_u32(row.consecutive_failures),
            failure_threshold: to_u32(row.failure_threshold),
            last_success_at: row.last_success_at,
            last_failure_at: row.last_failure_at,
            last_failure_reason: row.last_failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SUBSCRIPTION_COLUMNS: &str = "id, account_id, name, url, filter, retry_policy, \
     signing_secret, status, timeout_seconds, custom_headers, consecutive_failures, \
     failure_threshold, last_success_at, last_failure_at, last_failure_reason, created_at, \
     updated_at";

/// PostgreSQL subscription repository.
pub struct PgSubscriptionRepository {
    pool: PgPool,
}

impl PgSubscriptionRepository {
    /// Creates a repository over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock(
        tx: &mut Transaction<'_, Postgres>,
        id: SubscriptionId,
    ) -> Result<Subscription> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.0)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(Subscription::try_from)
            .transpose()?
            .ok_or_else(|| CoreError::NotFound(format!("subscription {id}")))
    }

    async fn write_health(
        tx: &mut Transaction<'_, Postgres>,
        subscription: &Subscription,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE subscriptions
            SET status = $2, consecutive_failures = $3, last_success_at = $4,
                last_failure_at = $5, last_failure_reason = $6, updated_at = $7
            WHERE id = $1
            ",
        )
        .bind(subscription.id.0)
        .bind(subscription.status.as_str())
        .bind(to_i32(subscription.consecutive_failures))
        .bind(subscription.last_success_at)
        .bind(subscription.last_failure_at)
        .bind(subscription.last_failure_reason.as_deref())
        .bind(subscription.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SubscriptionRepository for PgSubscriptionRepository {
    async fn upsert(&self, subscription: &Subscription) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO subscriptions (
                id, account_id, name, url, filter, retry_policy, signing_secret, status,
                timeout_seconds, custom_headers, consecutive_failures, failure_threshold,
                last_success_at, last_failure_at, last_failure_reason, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                url = EXCLUDED.url,
                filter = EXCLUDED.filter,
                retry_policy = EXCLUDED.retry_policy,
                signing_secret = EXCLUDED.signing_secret,
                status = EXCLUDED.status,
                timeout_seconds = EXCLUDED.timeout_seconds,
                custom_headers = EXCLUDED.custom_headers,
                failure_threshold = EXCLUDED.failure_threshold,
                updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(subscription.id.0)
        .bind(subscription.account_id.0)
        .bind(&subscription.name)
        .bind(&subscription.url)
        .bind(serde_json::to_value(&subscription.filter)?)
        .bind(serde_json::to_value(&subscription.retry_policy)?)
        .bind(&subscription.signing_secret)
        .bind(subscription.status.as_str())
        .bind(to_i32(subscription.timeout_seconds))
        .bind(serde_json::to_value(&subscription.custom_headers)?)
        .bind(to_i32(subscription.consecutive_failures))
        .bind(to_i32(subscription.failure_threshold))
        .bind(subscription.last_success_at)
        .bind(subscription.last_failure_at)
        .bind(subscription.last_failure_reason.as_deref())
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn list_active(&self, account_id: AccountId) -> Result<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r"
            SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
            WHERE account_id = $1 AND status = 'active'
            ORDER BY created_at ASC, id ASC
            "
        ))
        .bind(account_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn record_success(&self, id: SubscriptionId, now: DateTime<Utc>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let mut subscription = Self::lock(&mut tx, id).await?;
        subscription.record_success(now);
        Self::write_health(&mut tx, &subscription).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn record_failure(
        &self,
        id: SubscriptionId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let mut subscription = Self::lock(&mut tx, id).await?;
        let disabled = subscription.record_failure(reason, now);
        Self::write_health(&mut tx, &subscription).await?;
        tx.commit().await?;
        Ok(disabled)
    }
}
