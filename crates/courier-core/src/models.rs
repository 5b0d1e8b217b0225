//! Core domain models and strongly-typed identifiers.
//!
//! Defines events, subscriptions, delivery tasks and attempts, dead-letter
//! items, idempotency records and credentials, together with the newtype ID
//! wrappers that keep them from being mixed up. State transition rules for
//! events and tasks live next to the types they govern.

use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use rand::{distr::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use crate::filter::EventFilter;
use crate::error::CoreError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new identifier.
            ///
            /// Uses UUIDv7 so identifiers sort by creation time.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Identifier of an accepted event. Time-ordered.
    EventId
);
uuid_id!(
    /// Identifier of the account owning events, subscriptions and credentials.
    AccountId
);
uuid_id!(
    /// Identifier of a webhook subscription.
    SubscriptionId
);
uuid_id!(
    /// Identifier of a delivery task on the delivery queue.
    TaskId
);
uuid_id!(
    /// Identifier of a single recorded HTTP delivery attempt.
    AttemptId
);
uuid_id!(
    /// Identifier of an API credential.
    CredentialId
);

/// Delivery status of an event.
///
/// Moves forward only: `pending → processing → {delivered,
/// partially_delivered, failed}`. A terminal status may be recomputed into
/// another terminal status when a dead-lettered delivery is retried, but an
/// event never returns to `pending` or `processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Persisted, not yet matched against subscriptions.
    Pending,
    /// Delivery tasks are outstanding.
    Processing,
    /// Every matched subscription received the event, or none matched.
    Delivered,
    /// Some deliveries succeeded and some were dead-lettered.
    PartiallyDelivered,
    /// Every delivery was dead-lettered.
    Failed,
}

impl EventStatus {
    /// Returns the storage representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Delivered => "delivered",
            Self::PartiallyDelivered => "partially_delivered",
            Self::Failed => "failed",
        }
    }

    /// Returns whether all deliveries for the event have resolved.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::PartiallyDelivered | Self::Failed)
    }

    /// Returns whether moving from `self` to `next` respects forward-only
    /// ordering.
    pub const fn can_transition_to(&self, next: Self) -> bool {
        match (self, next) {
            (Self::Pending, _) => true,
            (Self::Processing, Self::Pending) => false,
            (Self::Processing, _) => true,
            (_, Self::Pending | Self::Processing) => false,
            _ => true,
        }
    }

    /// Computes the status implied by delivery counters.
    ///
    /// While deliveries are outstanding a terminal status is kept as is, so a
    /// retry of a dead-lettered delivery does not move the event backwards.
    pub fn from_counts(current: Self, matched: u32, successful: u32, failed: u32) -> Self {
        if matched == 0 {
            return Self::Delivered;
        }
        if successful.saturating_add(failed) < matched {
            return if current.is_terminal() { current } else { Self::Processing };
        }
        if failed == 0 {
            Self::Delivered
        } else if successful == 0 {
            Self::Failed
        } else {
            Self::PartiallyDelivered
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "delivered" => Ok(Self::Delivered),
            "partially_delivered" => Ok(Self::PartiallyDelivered),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::Serialization(format!("invalid event status: {other}"))),
        }
    }
}

/// Producer-supplied and system-assigned metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Client-supplied deduplication key, scoped to the account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    /// Correlation identifier propagated to subscribers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Identifier of the event that caused this one (set on replays).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,

    /// Any other producer metadata, passed through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// An accepted event and its delivery bookkeeping.
///
/// Everything except the status, counters and inbox/dispatch bookkeeping is
/// immutable once the event has been stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique, time-ordered identifier.
    pub id: EventId,

    /// Owning account.
    pub account_id: AccountId,

    /// Dot-separated event type, e.g. `order.created`.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Producer-defined origin of the event.
    pub source: String,

    /// Opaque payload.
    pub data: Value,

    /// Producer and system metadata.
    pub metadata: EventMetadata,

    /// Current delivery status.
    pub status: EventStatus,

    /// When the event was accepted.
    pub created_at: DateTime<Utc>,

    /// HTTP calls made for this event across all subscriptions.
    pub delivery_attempts: u32,

    /// Subscriptions that received the event.
    pub successful_deliveries: u32,

    /// Subscriptions whose delivery was dead-lettered or cancelled.
    pub failed_deliveries: u32,

    /// Subscriptions matched at dispatch time.
    pub matched_subscriptions: u32,

    /// Replays issued from this event.
    pub replay_count: u32,

    /// Original event when this event is a replay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_of: Option<EventId>,

    /// Restricts dispatch to these subscriptions (replays only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_subscriptions: Option<Vec<SubscriptionId>>,

    /// When an inbox consumer acknowledged the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,

    /// Dispatcher claim; the event is skipped by other dispatchers until it
    /// lapses.
    #[serde(skip)]
    pub dispatch_lease_until: Option<DateTime<Utc>>,
}

impl Event {
    /// Creates a pending event.
    pub fn new(
        account_id: AccountId,
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: Value,
        metadata: EventMetadata,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EventId::new(),
            account_id,
            event_type: event_type.into(),
            source: source.into(),
            data,
            metadata,
            status: EventStatus::Pending,
            created_at,
            delivery_attempts: 0,
            successful_deliveries: 0,
            failed_deliveries: 0,
            matched_subscriptions: 0,
            replay_count: 0,
            replay_of: None,
            target_subscriptions: None,
            acknowledged_at: None,
            dispatch_lease_until: None,
        }
    }

    /// Returns whether the inbox should still offer this event.
    ///
    /// Unacknowledged events awaiting delivery are offered, as are events
    /// that had no subscriber at all and are only reachable by polling.
    pub fn is_inbox_eligible(&self) -> bool {
        if self.acknowledged_at.is_some() {
            return false;
        }
        match self.status {
            EventStatus::Pending | EventStatus::Processing => true,
            EventStatus::Delivered => self.matched_subscriptions == 0,
            EventStatus::PartiallyDelivered | EventStatus::Failed => false,
        }
    }

    /// JSON body sent to webhook subscribers and stream consumers.
    pub fn payload(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "type": self.event_type,
            "source": self.source,
            "data": self.data,
            "metadata": self.metadata,
            "created_at": self.created_at,
        })
    }
}

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Receives matching events.
    Active,
    /// Temporarily excluded from dispatch by its owner.
    Paused,
    /// Excluded by an operator or by the failure threshold.
    Disabled,
}

impl SubscriptionStatus {
    /// Returns the storage representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "disabled" => Ok(Self::Disabled),
            other => {
                Err(CoreError::Serialization(format!("invalid subscription status: {other}")))
            },
        }
    }
}

/// Shape of the retry delay curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `initial_delay * multiplier^n`
    Exponential,
    /// `initial_delay * (n + 1)`
    Linear,
    /// `initial_delay`
    Fixed,
}

/// Per-subscription retry budget and delay curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total HTTP calls allowed, including the first.
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,

    /// Upper bound for any retry delay, in milliseconds.
    pub max_delay_ms: u64,

    /// Growth factor for exponential backoff.
    pub multiplier: f64,

    /// Delay curve.
    #[serde(default = "default_backoff_strategy")]
    pub strategy: BackoffStrategy,

    /// Random spread applied to each delay, as a fraction (0.1 = ±10%).
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_backoff_strategy() -> BackoffStrategy {
    BackoffStrategy::Exponential
}

fn default_jitter_factor() -> f64 {
    0.1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_delay_ms: 60_000,
            max_delay_ms: 3_600_000,
            multiplier: 2.0,
            strategy: default_backoff_strategy(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows `attempt_number` completed
    /// attempts, before jitter.
    ///
    /// For exponential backoff this is
    /// `min(max_delay, initial_delay * multiplier^(attempt_number - 1))`,
    /// so the first retry waits exactly `initial_delay`.
    pub fn base_delay(&self, attempt_number: u32) -> Duration {
        let initial = self.initial_delay_ms as f64;
        let exponent = attempt_number.saturating_sub(1);
        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => initial,
            BackoffStrategy::Linear => initial * f64::from(exponent + 1),
            BackoffStrategy::Exponential => {
                initial * self.multiplier.max(1.0).powi(i32::try_from(exponent).unwrap_or(i32::MAX))
            },
        };
        let capped = delay_ms.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Upper bound for any delay this policy can produce.
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// A registered webhook endpoint with filter, retry policy and health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// Unique identifier.
    pub id: SubscriptionId,

    /// Owning account.
    pub account_id: AccountId,

    /// Human-readable name.
    pub name: String,

    /// Destination URL.
    pub url: String,

    /// Event type globs and sources this subscription receives.
    pub filter: EventFilter,

    /// Retry budget and delay curve.
    pub retry_policy: RetryPolicy,

    /// HMAC key for the `X-Signature` header.
    #[serde(skip_serializing)]
    pub signing_secret: String,

    /// Lifecycle state.
    pub status: SubscriptionStatus,

    /// HTTP timeout for a single delivery call.
    pub timeout_seconds: u32,

    /// Extra headers sent with every delivery.
    #[serde(default)]
    pub custom_headers: BTreeMap<String, String>,

    /// Failed deliveries since the last success.
    pub consecutive_failures: u32,

    /// Consecutive failures after which the subscription disables itself.
    pub failure_threshold: u32,

    /// Last successful delivery.
    pub last_success_at: Option<DateTime<Utc>>,

    /// Last failed delivery.
    pub last_failure_at: Option<DateTime<Utc>>,

    /// Reason recorded with the last failure.
    pub last_failure_reason: Option<String>,

    /// Creation time.
    pub created_at: DateTime<Utc>,

    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Creates an active subscription with default policy and health.
    pub fn new(
        account_id: AccountId,
        url: impl Into<String>,
        signing_secret: impl Into<String>,
        filter: EventFilter,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SubscriptionId::new(),
            account_id,
            name: String::new(),
            url: url.into(),
            filter,
            retry_policy: RetryPolicy::default(),
            signing_secret: signing_secret.into(),
            status: SubscriptionStatus::Active,
            timeout_seconds: 30,
            custom_headers: BTreeMap::new(),
            consecutive_failures: 0,
            failure_threshold: 10,
            last_success_at: None,
            last_failure_at: None,
            last_failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns whether the subscription currently receives deliveries.
    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    /// Returns whether the subscription should receive `event`.
    pub fn matches(&self, event: &Event) -> bool {
        self.is_active() && self.filter.matches(&event.event_type, &event.source)
    }

    /// HTTP timeout for one delivery call.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout_seconds.max(1)))
    }

    /// Resets failure tracking after a successful delivery.
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures = 0;
        self.last_success_at = Some(now);
        self.updated_at = now;
    }

    /// Tracks a failed delivery and disables the subscription once the
    /// failure threshold is reached.
    ///
    /// Returns `true` when this call disabled the subscription.
    pub fn record_failure(&mut self, reason: &str, now: DateTime<Utc>) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_at = Some(now);
        self.last_failure_reason = Some(reason.to_string());
        self.updated_at = now;

        if self.failure_threshold > 0
            && self.consecutive_failures >= self.failure_threshold
            && self.status == SubscriptionStatus::Active
        {
            self.status = SubscriptionStatus::Disabled;
            return true;
        }
        false
    }
}

/// State of a delivery task on the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for `next_attempt_at`.
    Queued,
    /// Claimed by a worker until `lease_until`.
    Leased,
    /// Delivered.
    Completed,
    /// Retry budget exhausted; a DLQ item exists.
    Dead,
    /// Stopped by a dismissal or an inactive subscription.
    Cancelled,
}

impl TaskStatus {
    /// Returns the storage representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Leased => "leased",
            Self::Completed => "completed",
            Self::Dead => "dead",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns whether the task may still produce an HTTP call.
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Leased)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "leased" => Ok(Self::Leased),
            "completed" => Ok(Self::Completed),
            "dead" => Ok(Self::Dead),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(CoreError::Serialization(format!("invalid task status: {other}"))),
        }
    }
}

/// One (event, subscription) delivery on the delivery queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryTask {
    /// Unique identifier.
    pub id: TaskId,

    /// Event being delivered.
    pub event_id: EventId,

    /// Destination subscription.
    pub subscription_id: SubscriptionId,

    /// Owning account.
    pub account_id: AccountId,

    /// Attempts already made; 0 for a fresh task.
    pub attempt_number: u32,

    /// Queue state.
    pub status: TaskStatus,

    /// Earliest time a worker may claim the task.
    pub next_attempt_at: DateTime<Utc>,

    /// End of the current worker lease.
    pub lease_until: Option<DateTime<Utc>>,

    /// Fencing token of the current lease. Writes from a worker whose lease
    /// was reclaimed carry a stale token and are rejected.
    #[serde(skip)]
    pub lease_token: Option<Uuid>,

    /// Failure reason of the most recent attempt.
    pub last_error: Option<String>,

    /// Times an operator retried this pairing from the DLQ.
    pub dlq_retries: u32,

    /// Creation time.
    pub created_at: DateTime<Utc>,

    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl DeliveryTask {
    /// Creates a task that is due immediately.
    pub fn new(event: &Event, subscription_id: SubscriptionId, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            event_id: event.id,
            subscription_id,
            account_id: event.account_id,
            attempt_number: 0,
            status: TaskStatus::Queued,
            next_attempt_at: now,
            lease_until: None,
            lease_token: None,
            last_error: None,
            dlq_retries: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Result classification of a single HTTP delivery call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// 2xx response.
    Success,
    /// Non-2xx response.
    HttpError,
    /// No response within the timeout.
    Timeout,
    /// Connection could not be established or was reset.
    ConnectionError,
    /// Any other failure.
    UnknownError,
}

impl AttemptOutcome {
    /// Returns the storage representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::HttpError => "http_error",
            Self::Timeout => "timeout",
            Self::ConnectionError => "connection_error",
            Self::UnknownError => "unknown_error",
        }
    }

    /// Returns whether the attempt delivered the event.
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl FromStr for AttemptOutcome {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "http_error" => Ok(Self::HttpError),
            "timeout" => Ok(Self::Timeout),
            "connection_error" => Ok(Self::ConnectionError),
            "unknown_error" => Ok(Self::UnknownError),
            other => Err(CoreError::Serialization(format!("invalid attempt outcome: {other}"))),
        }
    }
}

/// Append-only record of one HTTP delivery call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    /// Unique identifier.
    pub id: AttemptId,

    /// Event delivered.
    pub event_id: EventId,

    /// Destination subscription.
    pub subscription_id: SubscriptionId,

    /// 1-based attempt counter for this pairing.
    pub attempt_number: u32,

    /// Classification of the result.
    pub outcome: AttemptOutcome,

    /// HTTP status when a response arrived.
    pub status_code: Option<u16>,

    /// Failure description.
    pub error_message: Option<String>,

    /// Response body, truncated.
    pub response_body: Option<String>,

    /// When the call started.
    pub attempted_at: DateTime<Utc>,

    /// Round-trip time in milliseconds.
    pub latency_ms: u64,
}

/// A delivery that exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqItem {
    /// Event that could not be delivered.
    pub event_id: EventId,

    /// Subscription that could not be reached.
    pub subscription_id: SubscriptionId,

    /// Owning account.
    pub account_id: AccountId,

    /// Event type, for filtering.
    pub event_type: String,

    /// Event source, for filtering.
    pub source: String,

    /// Last failure reason.
    pub failure_reason: String,

    /// Operator retries issued for this pairing so far.
    pub retry_count: u32,

    /// When the item entered the DLQ.
    pub created_at: DateTime<Utc>,
}

/// Maps an idempotency key to the event it created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Account the key is scoped to.
    pub account_id: AccountId,

    /// Client-supplied key.
    pub key: String,

    /// Event created for the key.
    pub event_id: EventId,

    /// After this instant the key may create a new event.
    pub expires_at: DateTime<Utc>,

    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Returns whether the record no longer deduplicates.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Permission carried by a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// Ingest events.
    #[serde(rename = "events:write")]
    EventsWrite,
    /// Read events, poll the inbox, open streams.
    #[serde(rename = "events:read")]
    EventsRead,
    /// Operate the DLQ and replays.
    #[serde(rename = "dlq:manage")]
    DlqManage,
}

impl Scope {
    /// Returns the wire representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::EventsWrite => "events:write",
            Self::EventsRead => "events:read",
            Self::DlqManage => "dlq:manage",
        }
    }
}

impl FromStr for Scope {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "events:write" => Ok(Self::EventsWrite),
            "events:read" => Ok(Self::EventsRead),
            "dlq:manage" => Ok(Self::DlqManage),
            other => Err(CoreError::InvalidInput(format!("unknown scope: {other}"))),
        }
    }
}

/// API credential, stored by the SHA-256 digest of its key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    /// Unique identifier.
    pub id: CredentialId,

    /// Account the credential acts for.
    pub account_id: AccountId,

    /// Human-readable name.
    pub name: String,

    /// Lowercase hex SHA-256 of the API key.
    #[serde(skip_serializing)]
    pub key_hash: String,

    /// Granted permissions.
    pub scopes: Vec<Scope>,

    /// Rate limit tier override; the configured default applies when unset.
    pub requests_per_minute: Option<u32>,

    /// Revocation time; revoked credentials never authenticate.
    pub revoked_at: Option<DateTime<Utc>>,

    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Credential {
    /// Returns whether the credential grants `scope`.
    pub fn has_scope(&self, scope: Scope) -> bool {
        self.scopes.contains(&scope)
    }
}

/// An event handed to an inbox poller together with its receipt handle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeasedEvent {
    /// The event.
    pub event: Event,

    /// Opaque handle used to acknowledge the event.
    pub receipt_handle: String,

    /// End of the visibility window.
    pub visible_until: DateTime<Utc>,

    /// Number of times the inbox has handed out this event.
    pub delivery_count: u32,
}

/// Generates an opaque inbox receipt handle.
pub fn new_receipt_handle() -> String {
    let token: String = rand::rng().sample_iter(&Alphanumeric).take(32).map(char::from).collect();
    format!("rcpt_{token}")
}
