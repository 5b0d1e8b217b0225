//! Dead letter queue: deliveries that exhausted their retry budget.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use super::{to_i32, to_i64, to_u32};
use crate::{
    error::Result,
    models::{AccountId, DlqItem, EventId, SubscriptionId},
};

/// Filters for listing DLQ items, newest first.
#[derive(Debug, Clone, Default)]
pub struct DlqQuery {
    /// Exact event type.
    pub event_type: Option<String>,
    /// Exact source.
    pub source: Option<String>,
    /// Destination subscription.
    pub subscription_id: Option<SubscriptionId>,
    /// Page size.
    pub limit: usize,
    /// Items to skip.
    pub offset: usize,
}

impl DlqQuery {
    /// Returns whether `item` passes the filters.
    pub fn accepts(&self, item: &DlqItem) -> bool {
        self.event_type.as_deref().is_none_or(|t| item.event_type == t)
            && self.source.as_deref().is_none_or(|s| item.source == s)
            && self.subscription_id.is_none_or(|id| item.subscription_id == id)
    }
}

/// One page of DLQ items plus the total matching the filters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DlqPage {
    /// Items on this page.
    pub items: Vec<DlqItem>,
    /// Items matching the filters across all pages.
    pub total: u64,
}

/// Aggregate view of an account's DLQ.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DlqStats {
    /// Items in the DLQ.
    pub total: u64,
    /// Item counts per event type.
    pub by_event_type: BTreeMap<String, u64>,
    /// Creation time of the oldest item.
    pub oldest: Option<DateTime<Utc>>,
}

/// Persistence for DLQ items.
#[async_trait]
pub trait DeadLetterRepository: Send + Sync {
    /// Inserts an item, replacing any previous item for the same pairing.
    async fn upsert(&self, item: &DlqItem) -> Result<()>;

    /// Lists an account's items newest first.
    async fn list(&self, account_id: AccountId, query: &DlqQuery) -> Result<DlqPage>;

    /// Removes an event's items for one subscription, or for all
    /// subscriptions when `subscription_id` is `None`. Returns the removed
    /// items.
    async fn remove(
        &self,
        account_id: AccountId,
        event_id: EventId,
        subscription_id: Option<SubscriptionId>,
    ) -> Result<Vec<DlqItem>>;

    /// Summarizes an account's DLQ.
    async fn stats(&self, account_id: AccountId) -> Result<DlqStats>;
}

#[derive(sqlx::FromRow)]
struct DlqRow {
    event_id: Uuid,
    subscription_id: Uuid,
    account_id: Uuid,
    event_type: String,
    source: String,
    failure_reason: String,
    retry_count: i32,
    created_at: DateTime<Utc>,
}

impl From<DlqRow> for DlqItem {
    fn from(row: DlqRow) -> Self {
        Self {
            event_id: EventId(row.event_id),
            subscription_id: SubscriptionId(row.subscription_id),
            account_id: AccountId(row.account_id),
            event_type: row.event_type,
            source: row.source,
            failure_reason: row.failure_reason,
            retry_count: to_u32(row.retry_count),
            created_at: row.created_at,
        }
    }
}

const DLQ_COLUMNS: &str =
    "event_id, subscription_id, account_id, event_type, source, failure_reason, retry_count, created_at";

/// PostgreSQL DLQ repository.
pub struct PgDeadLetterRepository {
    pool: PgPool,
}

impl PgDeadLetterRepository {
    /// Creates a repository over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterRepository for PgDeadLetterRepository {
    async fn upsert(&self, item: &DlqItem) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO dead_letters (
                event_id, subscription_id, account_id, event_type, source,
                failure_reason, retry_count, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (event_id, subscription_id) DO UPDATE SET
                failure_reason = EXCLUDED.failure_reason,
                retry_count = EXCLUDED.retry_count,
                created_at = EXCLUDED.created_at
            ",
        )
        .bind(item.event_id.0)
        .bind(item.subscription_id.0)
        .bind(item.account_id.0)
        .bind(&item.event_type)
        .bind(&item.source)
        .bind(&item.failure_reason)
        .bind(to_i32(item.retry_count))
        .bind(item.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list(&self, account_id: AccountId, query: &DlqQuery) -> Result<DlqPage> {
        const FILTER: &str = r"
            account_id = $1
            AND ($2::text IS NULL OR event_type = $2)
            AND ($3::text IS NULL OR source = $3)
            AND ($4::uuid IS NULL OR subscription_id = $4)
        ";

        let rows: Vec<DlqRow> = sqlx::query_as(&format!(
            r"
            SELECT {DLQ_COLUMNS} FROM dead_letters
            WHERE {FILTER}
            ORDER BY created_at DESC, event_id DESC, subscription_id DESC
            LIMIT $5 OFFSET $6
            "
        ))
        .bind(account_id.0)
        .bind(query.event_type.as_deref())
        .bind(query.source.as_deref())
        .bind(query.subscription_id.map(|id| id.0))
        .bind(to_i64(query.limit))
        .bind(to_i64(query.offset))
        .fetch_all(&self.pool)
        .await?;

        let total: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM dead_letters WHERE {FILTER}"))
                .bind(account_id.0)
                .bind(query.event_type.as_deref())
                .bind(query.source.as_deref())
                .bind(query.subscription_id.map(|id| id.0))
                .fetch_one(&self.pool)
                .await?;

        Ok(DlqPage {
            items: rows.into_iter().map(Into::into).collect(),
            total: u64::try_from(total).unwrap_or(0),
        })
    }

    async fn remove(
        &self,
        account_id: AccountId,
        event_id: EventId,
        subscription_id: Option<SubscriptionId>,
    ) -> Result<Vec<DlqItem>> {
        let rows: Vec<DlqRow> = sqlx::query_as(&format!(
            r"
            DELETE FROM dead_letters
            WHERE account_id = $1 AND event_id = $2
              AND ($3::uuid IS NULL OR subscription_id = $3)
            RETURNING {DLQ_COLUMNS}
            "
        ))
        .bind(account_id.0)
        .bind(event_id.0)
        .bind(subscription_id.map(|id| id.0))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn stats(&self, account_id: AccountId) -> Result<DlqStats> {
        let rows: Vec<(String, i64, DateTime<Utc>)> = sqlx::query_as(
            r"
            SELECT event_type, COUNT(*), MIN(created_at)
            FROM dead_letters
            WHERE account_id = $1
            GROUP BY event_type
            ",
        )
        .bind(account_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = DlqStats::default();
        for (event_type, count, oldest) in rows {
            let count = u64::try_from(count).unwrap_or(0);
            stats.total += count;
            stats.by_event_type.insert(event_type, count);
            stats.oldest = Some(stats.oldest.map_or(oldest, |current| current.min(oldest)));
        }
        Ok(stats)
    }
}
