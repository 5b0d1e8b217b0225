//! Builders for subscriptions and events with test-friendly defaults.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use courier_core::{
    AccountId, BackoffStrategy, Event, EventFilter, EventMetadata, RetryPolicy, Subscription,
    SubscriptionStatus,
};
use serde_json::{json, Value};

/// Signing secret used by default subscriptions.
pub const TEST_SECRET: &str = "whsec_test_secret";

/// Builder for test subscriptions.
///
/// Defaults: every event type, fast fixed retries (3 attempts, 1 s apart,
/// no jitter) and a 5 s timeout.
#[derive(Debug, Clone)]
pub struct SubscriptionBuilder {
    account_id: AccountId,
    url: String,
    secret: String,
    event_types: Vec<String>,
    sources: Vec<String>,
    retry_policy: RetryPolicy,
    status: SubscriptionStatus,
    timeout_seconds: u32,
    failure_threshold: u32,
    custom_headers: BTreeMap<String, String>,
}

impl SubscriptionBuilder {
    /// Creates a builder for a subscription of `account_id` delivering to
    /// `url`.
    pub fn new(account_id: AccountId, url: impl Into<String>) -> Self {
        Self {
            account_id,
            url: url.into(),
            secret: TEST_SECRET.to_string(),
            event_types: vec!["*".to_string()],
            sources: Vec::new(),
            retry_policy: RetryPolicy {
                max_attempts: 3,
                initial_delay_ms: 1_000,
                max_delay_ms: 10_000,
                multiplier: 2.0,
                strategy: BackoffStrategy::Fixed,
                jitter_factor: 0.0,
            },
            status: SubscriptionStatus::Active,
            timeout_seconds: 5,
            failure_threshold: 100,
            custom_headers: BTreeMap::new(),
        }
    }

    /// Sets the destination URL.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Sets the signing secret.
    #[must_use]
    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    /// Replaces the type globs.
    #[must_use]
    pub fn event_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Restricts the subscription to these sources.
    #[must_use]
    pub fn sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the attempt budget, keeping the fast fixed backoff.
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry_policy.max_attempts = max_attempts;
        self
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Sets the lifecycle status.
    #[must_use]
    pub fn status(mut self, status: SubscriptionStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the HTTP timeout in seconds.
    #[must_use]
    pub fn timeout_seconds(mut self, seconds: u32) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Sets how many consecutive failures disable the subscription.
    #[must_use]
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Adds a custom request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.insert(name.into(), value.into());
        self
    }

    /// Builds the subscription as of `now`.
    pub fn build(self, now: DateTime<Utc>) -> Subscription {
        let filter = EventFilter::for_types(self.event_types).with_sources(self.sources);
        let mut subscription = Subscription::new(self.account_id, self.url, self.secret, filter, now);
        subscription.retry_policy = self.retry_policy;
        subscription.status = self.status;
        subscription.timeout_seconds = self.timeout_seconds;
        subscription.failure_threshold = self.failure_threshold;
        subscription.custom_headers = self.custom_headers;
        subscription
    }
}

/// Builder for test events.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    account_id: AccountId,
    event_type: String,
    source: String,
    data: Value,
    metadata: EventMetadata,
}

impl EventBuilder {
    /// Creates an `order.created` event from `shop` for `account_id`.
    pub fn new(account_id: AccountId) -> Self {
        Self {
            account_id,
            event_type: "order.created".to_string(),
            source: "shop".to_string(),
            data: json!({"order_id": 1, "total": 4200}),
            metadata: EventMetadata::default(),
        }
    }

    /// Sets the event type.
    #[must_use]
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    /// Sets the source.
    #[must_use]
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.metadata.correlation_id = Some(id.into());
        self
    }

    /// Builds the pending event as of `now`.
    pub fn build(self, now: DateTime<Utc>) -> Event {
        Event::new(self.account_id, self.event_type, self.source, self.data, self.metadata, now)
    }
}
