//! Token bucket rate limiting for the ingestion API.
//!
//! Each credential owns a bucket holding up to `capacity` tokens that refills
//! continuously at `refill_per_second`. A request takes one token; a request
//! that finds less than one token is denied and takes nothing. Bucket state
//! lives in storage so replicas share it.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{storage::RateLimitRepository, time::Clock};

/// Bucket size and refill rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitTier {
    /// Maximum tokens, and the burst a fresh bucket allows.
    pub capacity: u32,
    /// Tokens added per second.
    pub refill_per_second: f64,
}

impl RateLimitTier {
    /// Tier allowing `rpm` requests per minute with a burst of `rpm`.
    pub fn per_minute(rpm: u32) -> Self {
        Self { capacity: rpm.max(1), refill_per_second: f64::from(rpm.max(1)) / 60.0 }
    }

    /// Capacity as a token amount.
    pub fn capacity_f64(&self) -> f64 {
        f64::from(self.capacity)
    }
}

impl Default for RateLimitTier {
    fn default() -> Self {
        Self::per_minute(600)
    }
}

/// Stored state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucket {
    /// Tokens available at `updated_at`.
    pub tokens: f64,
    /// Last refill time.
    pub updated_at: DateTime<Utc>,
}

/// Result of taking from a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOutcome {
    /// Whether a token was taken.
    pub allowed: bool,
    /// Tokens left after the take.
    pub tokens: f64,
}

impl TokenBucket {
    /// A full bucket.
    pub fn full(tier: RateLimitTier, now: DateTime<Utc>) -> Self {
        Self { tokens: tier.capacity_f64(), updated_at: now }
    }

    /// Refills for the time elapsed since the last update, then takes one
    /// token if at least one is available.
    pub fn take(&mut self, tier: RateLimitTier, now: DateTime<Utc>) -> BucketOutcome {
        if now > self.updated_at {
            let elapsed = (now - self.updated_at).to_std().unwrap_or_default().as_secs_f64();
            self.tokens = (self.tokens + elapsed * tier.refill_per_second).min(tier.capacity_f64());
            self.updated_at = now;
        }
        self.tokens = self.tokens.min(tier.capacity_f64());

        let allowed = self.tokens >= 1.0;
        if allowed {
            self.tokens -= 1.0;
        }
        BucketOutcome { allowed, tokens: self.tokens }
    }
}

/// Outcome of a rate limit check, with the values for response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Bucket capacity (`X-RateLimit-Limit`).
    pub limit: u32,
    /// Whole tokens left (`X-RateLimit-Remaining`).
    pub remaining: u32,
    /// When the bucket will be full again (`X-RateLimit-Reset`).
    pub reset_at: DateTime<Utc>,
    /// Wait before a token is available; set only on denial.
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    fn from_outcome(tier: RateLimitTier, outcome: BucketOutcome, now: DateTime<Utc>) -> Self {
        let refill = tier.refill_per_second.max(f64::MIN_POSITIVE);
        let to_full = ((tier.capacity_f64() - outcome.tokens).max(0.0) / refill).ceil();
        let reset_at = now + chrono::Duration::seconds(to_full as i64);

        let retry_after = (!outcome.allowed).then(|| {
            let secs = ((1.0 - outcome.tokens).max(0.0) / refill).ceil().max(1.0);
            Duration::from_secs(secs as u64)
        });

        Self {
            allowed: outcome.allowed,
            limit: tier.capacity,
            remaining: outcome.tokens.floor().max(0.0) as u32,
            reset_at,
            retry_after,
        }
    }

    /// Decision used when the bucket store cannot be reached.
    fn fail_open(tier: RateLimitTier, now: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            limit: tier.capacity,
            remaining: tier.capacity,
            reset_at: now,
            retry_after: None,
        }
    }
}

/// Checks requests against per-key token buckets.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitRepository>,
    clock: Arc<dyn Clock>,
    default_tier: RateLimitTier,
}

impl RateLimiter {
    /// Creates a limiter applying `default_tier` to keys without their own.
    pub fn new(
        store: Arc<dyn RateLimitRepository>,
        clock: Arc<dyn Clock>,
        default_tier: RateLimitTier,
    ) -> Self {
        Self { store, clock, default_tier }
    }

    /// The tier used when a credential has no override.
    pub fn default_tier(&self) -> RateLimitTier {
        self.default_tier
    }

    /// Takes one token from the bucket for `key`.
    ///
    /// Storage failures allow the request and log a warning.
    pub async fn check(&self, key: &str, tier: Option<RateLimitTier>) -> RateLimitDecision {
        let tier = tier.unwrap_or(self.default_tier);
        let now = self.clock.now_utc();

        match self.store.take(key, tier, now).await {
            Ok(outcome) => RateLimitDecision::from_outcome(tier, outcome, now),
            Err(e) => {
                warn!(key, error = %e, "rate limit store unavailable, allowing request");
                RateLimitDecision::fail_open(tier, now)
            },
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").field("default_tier", &self.default_tier).finish()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;
    use crate::{storage::MemoryStore, time::TestClock};

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).single().unwrap()
    }

    #[test]
    fn denied_take_consumes_nothing() {
        let tier = RateLimitTier { capacity: 1, refill_per_second: 1.0 };
        let mut bucket = TokenBucket::full(tier, t0());

        assert!(bucket.take(tier, t0()).allowed);
        let denied = bucket.take(tier, t0());
        assert!(!denied.allowed);
        assert!(denied.tokens.abs() < f64::EPSILON);

        let later = t0() + chrono::Duration::seconds(1);
        assert!(bucket.take(tier, later).allowed);
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let tier = RateLimitTier::per_minute(60);
        let mut bucket = TokenBucket { tokens: 0.0, updated_at: t0() };

        let outcome = bucket.take(tier, t0() + chrono::Duration::hours(1));

        assert!(outcome.allowed);
        assert!((outcome.tokens - 59.0).abs() < 1e-9);
    }

    #[test]
    fn denial_reports_retry_after() {
        let tier = RateLimitTier { capacity: 2, refill_per_second: 0.5 };
        let decision = RateLimitDecision::from_outcome(
            tier,
            BucketOutcome { allowed: false, tokens: 0.0 },
            t0(),
        );

        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.retry_after, Some(Duration::from_secs(2)));
        assert_eq!(decision.reset_at, t0() + chrono::Duration::seconds(4));
    }

    #[tokio::test]
    async fn limiter_uses_shared_store_and_falls_back_to_default_tier() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(TestClock::new());
        let limiter = RateLimiter::new(store, clock.clone(), RateLimitTier::per_minute(2));

        assert!(limiter.check("cred-a", None).await.allowed);
        assert!(limiter.check("cred-a", None).await.allowed);
        let third = limiter.check("cred-a", None).await;
        assert!(!third.allowed);
        assert_eq!(third.limit, 2);
        assert!(third.retry_after.is_some());

        // other keys have their own bucket
        assert!(limiter.check("cred-b", None).await.allowed);

        clock.advance_secs(30);
        assert!(limiter.check("cred-a", None).await.allowed);
    }

    #[tokio::test]
    async fn limiter_fails_open_when_store_is_down() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let limiter =
            RateLimiter::new(store, Arc::new(TestClock::new()), RateLimitTier::per_minute(1));

        for _ in 0..5 {
            assert!(limiter.check("cred", None).await.allowed);
        }
    }

    proptest! {
        #[test]
        fn burst_admits_exactly_capacity(capacity in 1u32..200, extra in 1usize..50) {
            let tier = RateLimitTier::per_minute(capacity);
            let mut bucket = TokenBucket::full(tier, t0());

            let allowed = (0..capacity as usize + extra)
                .filter(|_| bucket.take(tier, t0()).allowed)
                .count();

            prop_assert_eq!(allowed, capacity as usize);
        }
    }
}
