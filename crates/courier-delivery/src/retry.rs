//! Retry scheduling with backoff and jitter.
//!
//! A failed attempt is either rescheduled on the delivery queue or given up
//! on. Workers never sleep between attempts: the decision carries the time
//! at which the task becomes due again, and any worker may pick it up then.

use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_core::RetryPolicy;
use rand::Rng;

use crate::error::DeliveryError;

/// Retry decision context for a failed delivery attempt.
#[derive(Debug, Clone)]
pub struct RetryContext<'a> {
    /// Attempts made so far, including the one that just failed.
    pub attempts_made: u32,
    /// Error that caused the failure.
    pub error: &'a DeliveryError,
    /// When the failed attempt finished.
    pub failed_at: DateTime<Utc>,
    /// Subscription retry policy.
    pub policy: &'a RetryPolicy,
}

/// Result of the retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry at the given time.
    Retry {
        /// When the task becomes due again
        next_attempt_at: DateTime<Utc>,
    },
    /// Dead-letter the pairing.
    GiveUp {
        /// Why no further attempt is made
        reason: String,
    },
}

impl<'a> RetryContext<'a> {
    /// Creates a retry context for a failed attempt.
    pub fn new(
        attempts_made: u32,
        error: &'a DeliveryError,
        failed_at: DateTime<Utc>,
        policy: &'a RetryPolicy,
    ) -> Self {
        Self { attempts_made, error, failed_at, policy }
    }

    /// Decides whether and when to retry.
    pub fn decide(&self) -> RetryDecision {
        if self.attempts_made >= self.policy.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) exhausted", self.policy.max_attempts),
            };
        }

        if !self.error.is_retryable() {
            return RetryDecision::GiveUp {
                reason: format!("non-retryable error: {}", self.error),
            };
        }

        let retry_after = self.error.retry_after_seconds().map(Duration::from_secs);
        let delay = retry_delay(self.policy, self.attempts_made, retry_after);
        let Ok(chrono_delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp {
                reason: "retry delay duration out of range".to_string(),
            };
        };

        RetryDecision::Retry { next_attempt_at: self.failed_at + chrono_delay }
    }
}

/// Delay before the next attempt after `attempts_made` attempts.
///
/// The policy's base delay is jittered and capped at `max_delay`. A
/// subscriber's `Retry-After` acts as a floor, itself capped at
/// `max_delay`.
pub fn retry_delay(
    policy: &RetryPolicy,
    attempts_made: u32,
    retry_after: Option<Duration>,
) -> Duration {
    let max_delay = policy.max_delay();
    let backoff = apply_jitter(policy.base_delay(attempts_made), policy.jitter_factor).min(max_delay);

    match retry_after {
        Some(hint) => backoff.max(hint.min(max_delay)),
        None => backoff,
    }
}

/// Randomizes `duration` by ±`jitter_factor`.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);
    let jittered_secs = duration.as_secs_f64() + jitter_offset;

    Duration::from_secs_f64(jittered_secs.max(0.0))
}
