//! Webhook dispatch and delivery with reliability guarantees.
//!
//! Accepted events flow through two stages:
//!
//! 1. **Dispatch** - the [`Dispatcher`] claims pending events, matches them
//!    against active subscriptions and enqueues one delivery task per match
//! 2. **Delivery** - a pool of workers claims due tasks under a lease,
//!    sends the signed webhook, and completes, reschedules or dead-letters
//!    the task
//!
//! Failed pairings land in the dead letter queue, where the [`DlqManager`]
//! can requeue or dismiss them. The [`ReplayEngine`] re-dispatches stored
//! events as new events linked to the original.
//!
//! # Key Features
//!
//! - **Lease-based work distribution** - `FOR UPDATE SKIP LOCKED` claims
//!   with fencing tokens, so a stalled worker cannot clobber a newer result
//! - **Non-blocking retries** - backoff is expressed as `next_attempt_at`
//!   on the queue; no worker sleeps on a failed delivery
//! - **HMAC-signed requests** - see [`signing`]
//! - **Graceful shutdown** - workers finish in-flight deliveries before exit
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::{RealClock, Storage};
//! use courier_delivery::{DeliveryConfig, DeliveryEngine, DeliveryError};
//!
//! # async fn example(storage: Storage) -> std::result::Result<(), DeliveryError> {
//! let mut engine =
//!     DeliveryEngine::new(storage, DeliveryConfig::default(), Arc::new(RealClock::new()))?;
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

pub mod client;
pub mod dispatcher;
pub mod dlq;
pub mod engine;
pub mod error;
pub mod replay;
pub mod retry;
pub mod signing;
mod worker;
mod worker_pool;

pub use client::{ClientConfig, DeliveryClient};
pub use dispatcher::{Dispatcher, DispatcherConfig, Wakeup};
pub use dlq::{DlqError, DlqManager, DlqRetryOutcome};
pub use engine::{DeliveryConfig, DeliveryEngine, EngineStats, RunReport};
pub use error::{DeliveryError, Result};
pub use replay::{ReplayConfig, ReplayEngine, ReplayError, ReplayRequest, ReplayResult};
pub use signing::{sign, verify_signature, SignatureError};

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default number of tasks a worker claims per batch.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(1))
}
