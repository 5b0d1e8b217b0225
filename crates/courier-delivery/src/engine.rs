//! Delivery engine: dispatcher plus worker pool.
//!
//! ```text
//! ┌────────────┐ notify ┌────────────┐ tasks ┌─────────────┐ POST ┌────────────┐
//! │ Ingestion  │ ─────▶ │ Dispatcher │ ────▶ │ Worker Pool │ ───▶ │ Subscriber │
//! └────────────┘        └────────────┘       └──────┬──────┘      └────────────┘
//!                                                   │ exhausted
//!                                                   ▼
//!                                            ┌─────────────┐
//!                                            │     DLQ     │
//!                                            └─────────────┘
//! ```
//!
//! `start` spawns the dispatcher loop and the workers; `run_once` runs one
//! dispatch round and one worker batch inline, which is how tests drive the
//! engine against a manual clock.

use std::{sync::Arc, time::Duration};

use courier_core::{storage::Storage, Clock, EventHandler, TracingEventHandler};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    client::{ClientConfig, DeliveryClient},
    dispatcher::{Dispatcher, DispatcherConfig, Wakeup},
    error::Result,
    worker::{DeliveryWorker, WorkerContext},
    worker_pool::WorkerPool,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,

    /// Maximum tasks a worker claims per batch.
    pub batch_size: usize,

    /// How often idle workers poll for due tasks.
    pub poll_interval: Duration,

    /// Lease taken on a claimed task; extended by the subscription timeout
    /// right before the HTTP call.
    pub task_visibility_timeout: Duration,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Dispatcher configuration.
    pub dispatcher: DispatcherConfig,

    /// Maximum time to wait for workers to finish on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_secs(1),
            task_visibility_timeout: Duration::from_secs(60),
            client_config: ClientConfig::default(),
            dispatcher: DispatcherConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Counters for engine monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Number of running delivery workers.
    pub active_workers: usize,
    /// Tasks taken through a delivery attempt or cancellation.
    pub tasks_processed: u64,
    /// Attempts answered with a 2xx.
    pub successful_deliveries: u64,
    /// Failed attempts, retried or not.
    pub failed_attempts: u64,
    /// Pairings that exhausted their retry budget.
    pub dead_lettered: u64,
    /// Pairings cancelled because their subscription stopped being active.
    pub cancelled: u64,
    /// Attempts currently in flight.
    pub in_flight_deliveries: u64,
}

/// Outcome of one inline engine round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Events moved out of `pending`.
    pub events_dispatched: usize,
    /// Tasks claimed by the worker batch.
    pub tasks_processed: usize,
}

/// Coordinates the dispatcher and the delivery workers.
pub struct DeliveryEngine {
    context: WorkerContext,
    dispatcher: Dispatcher,
    dispatch_wakeup: Wakeup,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
}

impl DeliveryEngine {
    /// Creates an engine whose lifecycle notifications go to `event_handler`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_event_handler(
        storage: Storage,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
        event_handler: Arc<dyn EventHandler>,
    ) -> Result<Self> {
        let client = Arc::new(DeliveryClient::new(config.client_config.clone(), clock.clone())?);
        let dispatch_wakeup = Wakeup::new();
        let delivery_wakeup = Wakeup::new();
        let dispatcher = Dispatcher::new(
            storage.clone(),
            clock.clone(),
            config.dispatcher,
            dispatch_wakeup.clone(),
            delivery_wakeup.clone(),
        );

        let context = WorkerContext {
            storage,
            config,
            client,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            event_handler,
            clock,
            wakeup: delivery_wakeup,
        };

        Ok(Self {
            context,
            dispatcher,
            dispatch_wakeup,
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
        })
    }

    /// Creates an engine that writes lifecycle notifications to the audit
    /// log.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(storage: Storage, config: DeliveryConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::with_event_handler(storage, config, clock, Arc::new(TracingEventHandler))
    }

    /// Signal that wakes the dispatcher; ingestion and replay hold a clone.
    pub fn dispatch_wakeup(&self) -> Wakeup {
        self.dispatch_wakeup.clone()
    }

    /// Signal that wakes idle workers; the DLQ manager holds a clone.
    pub fn delivery_wakeup(&self) -> Wakeup {
        self.context.wakeup.clone()
    }

    /// Spawns the dispatcher loop and the worker pool.
    ///
    /// Returns immediately. Use `shutdown()` to stop gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool fails to spawn.
    pub async fn start(&mut self) -> Result<()> {
        info!(
            worker_count = self.context.config.worker_count,
            batch_size = self.context.config.batch_size,
            "starting delivery engine"
        );

        let mut worker_pool = WorkerPool::new(
            self.context.clone(),
            self.dispatcher.clone(),
            self.cancellation_token.clone(),
        );
        worker_pool.spawn_workers().await?;
        self.worker_pool = Some(worker_pool);

        info!("delivery engine started");
        Ok(())
    }

    /// Stops dispatching and waits for in-flight deliveries to finish.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if workers outlive the
    /// configured shutdown timeout.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");

        if let Some(worker_pool) = self.worker_pool.take() {
            worker_pool.shutdown_graceful(self.context.config.shutdown_timeout).await?;
        } else {
            info!("delivery engine was not started, shutdown completed immediately");
        }
        Ok(())
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.context.stats.read().await.clone()
    }

    /// Runs one dispatch round.
    ///
    /// # Errors
    ///
    /// Returns an error if pending events cannot be claimed.
    pub async fn dispatch_pending(&self) -> Result<usize> {
        self.dispatcher.dispatch_pending().await
    }

    /// Processes exactly one batch of due tasks inline.
    ///
    /// # Errors
    ///
    /// Returns an error if due tasks cannot be claimed.
    pub async fn process_batch(&self) -> Result<usize> {
        let worker = DeliveryWorker::new(0, self.context.clone(), self.cancellation_token.clone());
        worker.process_batch().await
    }

    /// Runs one dispatch round followed by one worker batch.
    ///
    /// # Errors
    ///
    /// Returns an error if either stage cannot claim work.
    pub async fn run_once(&self) -> Result<RunReport> {
        let events_dispatched = self.dispatch_pending().await?;
        let tasks_processed = self.process_batch().await?;
        Ok(RunReport { events_dispatched, tasks_processed })
    }
}

impl std::fmt::Debug for DeliveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryEngine")
            .field("config", &self.context.config)
            .field("running", &self.worker_pool.is_some())
            .finish_non_exhaustive()
    }
}
