//! Core domain models, storage and shared services.
//!
//! Provides the strongly-typed event, subscription and delivery primitives,
//! the repository layer (PostgreSQL and in-memory), and the services that
//! sit directly on top of storage: the inbox, the rate limiter and the live
//! stream publisher. The delivery and API crates build on these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod filter;
pub mod inbox;
pub mod models;
pub mod rate_limit;
pub mod storage;
pub mod stream;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    DeliveryEvent, DeliveryFailedEvent, DeliverySucceededEvent, EventHandler,
    MulticastEventHandler, NoOpEventHandler, TracingEventHandler,
};
pub use filter::EventFilter;
pub use inbox::{Inbox, InboxConfig, InboxPage};
pub use models::{
    AccountId, AttemptId, AttemptOutcome, BackoffStrategy, Credential, CredentialId,
    DeliveryAttempt, DeliveryTask, DlqItem, Event, EventId, EventMetadata, EventStatus,
    IdempotencyRecord, LeasedEvent, RetryPolicy, Scope, Subscription, SubscriptionId,
    SubscriptionStatus, TaskId, TaskStatus,
};
pub use rate_limit::{RateLimitDecision, RateLimitTier, RateLimiter};
pub use storage::Storage;
pub use stream::{StreamPublisher, StreamSubscription};
pub use time::{Clock, RealClock, TestClock};
