//! Worker pool management with structured concurrency.
//!
//! Owns the join handles of the dispatcher loop and the delivery workers,
//! and shuts them down together under a timeout.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    dispatcher::Dispatcher,
    error::{DeliveryError, Result},
    worker::{DeliveryWorker, WorkerContext},
};

/// Supervised set of delivery workers plus the dispatcher loop.
pub(crate) struct WorkerPool {
    context: WorkerContext,
    dispatcher: Dispatcher,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
    dispatcher_handle: Option<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        context: WorkerContext,
        dispatcher: Dispatcher,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            context,
            dispatcher,
            cancellation_token,
            worker_handles: Vec::new(),
            dispatcher_handle: None,
        }
    }

    /// Spawns the dispatcher loop and all configured workers.
    pub async fn spawn_workers(&mut self) -> Result<()> {
        let worker_count = self.context.config.worker_count;
        if worker_count == 0 {
            return Err(DeliveryError::configuration("worker_count must be at least 1"));
        }
        info!(worker_count, "spawning delivery workers");

        let dispatcher = self.dispatcher.clone();
        let token = self.cancellation_token.clone();
        self.dispatcher_handle = Some(tokio::spawn(async move { dispatcher.run(token).await }));

        self.context.stats.write().await.active_workers = worker_count;

        for worker_id in 0..worker_count {
            let worker =
                DeliveryWorker::new(worker_id, self.context.clone(), self.cancellation_token.clone());

            let handle = tokio::spawn(async move {
                let result = worker.run().await;
                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "delivery worker terminated with error");
                }
                result
            });

            self.worker_handles.push(handle);
        }

        info!(spawned_workers = self.worker_handles.len(), "all delivery workers spawned");
        Ok(())
    }

    /// Cancels all workers and waits up to `timeout` for in-flight
    /// deliveries to complete.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let worker_handles = std::mem::take(&mut self.worker_handles);
        let dispatcher_handle = self.dispatcher_handle.take();
        let stats = self.context.stats.clone();

        let shutdown_future = async move {
            let mut panics = 0_usize;

            if let Some(handle) = dispatcher_handle {
                if let Err(join_error) = handle.await {
                    error!(error = %join_error, "dispatcher task panicked during shutdown");
                    panics += 1;
                }
            }

            for (worker_id, handle) in worker_handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(worker_id, error = %error, "worker completed with error during shutdown");
                    },
                    Err(join_error) => {
                        let panic = DeliveryError::WorkerPanic {
                            worker_id,
                            error: join_error.to_string(),
                        };
                        error!(error = %panic, "worker task panicked during shutdown");
                        panics += 1;
                    },
                }
            }

            stats.write().await.active_workers = 0;
            panics
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(panics) => {
                if panics > 0 {
                    warn!(panics, "some workers panicked during shutdown");
                }
                info!("worker pool shutdown completed");
                Ok(())
            },
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }
}
