//! Delivery invariants checked after scenario tests.

use std::collections::{HashMap, HashSet};

use anyhow::{ensure, Result};
use courier_core::{DeliveryAttempt, DlqItem, Event, EventStatus, SubscriptionId};

/// Checks that must hold for any event at any time.
pub struct Invariants;

impl Invariants {
    /// Attempt numbers per subscription start at 1 and grow by one. A DLQ
    /// retry starts a new run at 1.
    pub fn attempt_numbers_increase(attempts: &[DeliveryAttempt]) -> Result<()> {
        let mut last: HashMap<SubscriptionId, u32> = HashMap::new();
        for attempt in attempts {
            let previous = last.insert(attempt.subscription_id, attempt.attempt_number).unwrap_or(0);
            ensure!(
                attempt.attempt_number == previous + 1
                    || (previous > 0 && attempt.attempt_number == 1),
                "attempt {} for subscription {} follows attempt {previous}",
                attempt.attempt_number,
                attempt.subscription_id
            );
        }
        Ok(())
    }

    /// No subscription saw more than `max_attempts` attempts in one run.
    pub fn attempts_within_budget(attempts: &[DeliveryAttempt], max_attempts: u32) -> Result<()> {
        for attempt in attempts {
            ensure!(
                attempt.attempt_number <= max_attempts,
                "attempt {} exceeds budget {max_attempts}",
                attempt.attempt_number
            );
        }
        Ok(())
    }

    /// Resolved deliveries never exceed the matched count, and a delivered
    /// event reached every matched subscription.
    pub fn counters_consistent(event: &Event) -> Result<()> {
        let resolved = event.successful_deliveries + event.failed_deliveries;
        ensure!(
            resolved <= event.matched_subscriptions,
            "event {} resolved {resolved} of {} deliveries",
            event.id,
            event.matched_subscriptions
        );
        if event.status == EventStatus::Delivered {
            ensure!(
                event.successful_deliveries == event.matched_subscriptions,
                "delivered event {} reached {} of {} subscriptions",
                event.id,
                event.successful_deliveries,
                event.matched_subscriptions
            );
        }
        Ok(())
    }

    /// At most one DLQ item exists per (event, subscription).
    pub fn one_dlq_item_per_pair(items: &[DlqItem]) -> Result<()> {
        let mut seen = HashSet::new();
        for item in items {
            ensure!(
                seen.insert((item.event_id, item.subscription_id)),
                "duplicate DLQ item for event {} and subscription {}",
                item.event_id,
                item.subscription_id
            );
        }
        Ok(())
    }
}
