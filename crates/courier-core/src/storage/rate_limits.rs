//! Token bucket state shared by every API replica.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    rate_limit::{BucketOutcome, RateLimitTier, TokenBucket},
};

/// Persistence for rate limit buckets.
#[async_trait]
pub trait RateLimitRepository: Send + Sync {
    /// Refills the bucket for `key` and takes one token if available.
    ///
    /// Buckets start full. A denied request consumes nothing.
    async fn take(
        &self,
        key: &str,
        tier: RateLimitTier,
        now: DateTime<Utc>,
    ) -> Result<BucketOutcome>;
}

/// PostgreSQL rate limit repository.
pub struct PgRateLimitRepository {
    pool: PgPool,
}

impl PgRateLimitRepository {
    /// Creates a repository over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateLimitRepository for PgRateLimitRepository {
    async fn take(
        &self,
        key: &str,
        tier: RateLimitTier,
        now: DateTime<Utc>,
    ) -> Result<BucketOutcome> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            INSERT INTO rate_limit_buckets (key, tokens, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO NOTHING
            ",
        )
        .bind(key)
        .bind(tier.capacity_f64())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let (tokens, updated_at): (f64, DateTime<Utc>) = sqlx::query_as(
            "SELECT tokens, updated_at FROM rate_limit_buckets WHERE key = $1 FOR UPDATE",
        )
        .bind(key)
        .fetch_one(&mut *tx)
        .await?;

        let mut bucket = TokenBucket { tokens, updated_at };
        let outcome = bucket.take(tier, now);

        sqlx::query("UPDATE rate_limit_buckets SET tokens = $2, updated_at = $3 WHERE key = $1")
            .bind(key)
            .bind(bucket.tokens)
            .bind(bucket.updated_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(outcome)
    }
}
