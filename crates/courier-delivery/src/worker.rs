//! Delivery worker: claims due tasks and carries each through one attempt.
//!
//! Per task the worker reloads the task and its subscription, checks that
//! it still holds the lease and that the subscription is active, renews the
//! lease to cover the HTTP timeout, sends the webhook, records the attempt,
//! and then completes, reschedules or dead-letters the task. Every write
//! after the claim presents the lease token, so a worker whose lease lapsed
//! mid-call cannot overwrite the result of the worker that reclaimed it.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::{
    events::{DeliveryAttemptStartedEvent, DeliveryDeadLetteredEvent},
    storage::{OutcomeDelta, Storage},
    AttemptId, AttemptOutcome, Clock, DeliveryAttempt, DeliveryEvent, DeliveryFailedEvent,
    DeliverySucceededEvent, DeliveryTask, DlqItem, Event, EventHandler, Subscription, TaskStatus,
};
use futures::future::join_all;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    chrono_duration,
    client::{DeliveryClient, DeliveryRequest, DeliveryResponse},
    dispatcher::Wakeup,
    engine::{DeliveryConfig, EngineStats},
    error::{DeliveryError, Result},
    retry::{RetryContext, RetryDecision},
};

/// Dependencies shared by every worker of an engine.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub storage: Storage,
    pub config: DeliveryConfig,
    pub client: Arc<DeliveryClient>,
    pub stats: Arc<RwLock<EngineStats>>,
    pub event_handler: Arc<dyn EventHandler>,
    pub clock: Arc<dyn Clock>,
    pub wakeup: Wakeup,
}

/// What happened to a claimed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskOutcome {
    Delivered,
    Retrying,
    DeadLettered,
    Cancelled,
    /// The lease was lost or the worker is stopping; nothing was written.
    Skipped,
}

/// Individual worker that processes delivery tasks.
pub(crate) struct DeliveryWorker {
    id: usize,
    context: WorkerContext,
    cancellation_token: CancellationToken,
}

impl DeliveryWorker {
    pub fn new(id: usize, context: WorkerContext, cancellation_token: CancellationToken) -> Self {
        Self { id, context, cancellation_token }
    }

    /// Claims and processes batches until cancelled.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, "delivery worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, "delivery worker received shutdown signal");
                break;
            }

            match self.process_batch().await {
                Ok(0) => {
                    tokio::select! {
                        () = self.context.wakeup.notified() => {}
                        () = self.context.clock.sleep(self.context.config.poll_interval) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
                Ok(_) => {},
                Err(error) => {
                    error!(worker_id = self.id, error = %error, "worker batch processing failed");
                    tokio::select! {
                        () = self.context.clock.sleep(Duration::from_secs(5)) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = self.id, "delivery worker stopped");
        Ok(())
    }

    /// Claims one batch of due tasks and delivers them concurrently.
    ///
    /// Returns the number of tasks claimed.
    pub async fn process_batch(&self) -> Result<usize> {
        let now = self.context.clock.now_utc();
        let lease_until = now + chrono_duration(self.context.config.task_visibility_timeout);
        let tasks = self
            .context
            .storage
            .tasks
            .claim_due(now, lease_until, self.context.config.batch_size)
            .await
            .map_err(|e| DeliveryError::storage(format!("failed to claim due tasks: {e}")))?;

        let batch_size = tasks.len();
        if batch_size > 0 {
            debug!(worker_id = self.id, batch_size, "processing task batch");
        }

        let results = join_all(tasks.into_iter().map(|task| self.process_task(task))).await;
        for result in results {
            if let Err(error) = result {
                error!(
                    worker_id = self.id,
                    error = %error,
                    category = %error.category(),
                    "task processing failed"
                );
            }
        }

        Ok(batch_size)
    }

    async fn process_task(&self, task: DeliveryTask) -> Result<TaskOutcome> {
        let Some(token) = task.lease_token else {
            return Ok(TaskOutcome::Skipped);
        };

        self.context.stats.write().await.in_flight_deliveries += 1;
        let result = self.attempt_task(&task, token).await;
        {
            let mut stats = self.context.stats.write().await;
            stats.in_flight_deliveries = stats.in_flight_deliveries.saturating_sub(1);
            if matches!(result, Ok(outcome) if outcome != TaskOutcome::Skipped) {
                stats.tasks_processed += 1;
            }
        }
        result
    }

    async fn attempt_task(&self, claimed: &DeliveryTask, token: Uuid) -> Result<TaskOutcome> {
        let storage = &self.context.storage;

        let Some(task) = storage.tasks.find(claimed.id).await? else {
            return Ok(TaskOutcome::Skipped);
        };
        if task.status != TaskStatus::Leased || task.lease_token != Some(token) {
            debug!(
                worker_id = self.id,
                task_id = %task.id,
                status = %task.status,
                "task no longer leased by this worker, skipping"
            );
            return Ok(TaskOutcome::Skipped);
        }

        let event = storage
            .events
            .find(task.event_id)
            .await?
            .ok_or_else(|| DeliveryError::internal(format!("event {} missing", task.event_id)))?;

        let subscription = match storage.subscriptions.find(task.subscription_id).await? {
            Some(subscription) if subscription.is_active() => subscription,
            Some(subscription) => {
                let reason = format!("subscription {}", subscription.status);
                return self.cancel(&task, token, &event, &reason).await;
            },
            None => return self.cancel(&task, token, &event, "subscription deleted").await,
        };

        if self.cancellation_token.is_cancelled() {
            return Ok(TaskOutcome::Skipped);
        }

        let now = self.context.clock.now_utc();
        let lease_until = now
            + chrono_duration(subscription.timeout() + self.context.config.task_visibility_timeout);
        if !storage.tasks.renew_lease(task.id, token, lease_until).await? {
            return Ok(TaskOutcome::Skipped);
        }

        let attempt_number = task.attempt_number + 1;
        let request = DeliveryRequest::new(&event, &subscription, attempt_number)?;
        let attempt_id = request.attempt_id;

        debug!(
            worker_id = self.id,
            event_id = %event.id,
            subscription_id = %subscription.id,
            attempt = attempt_number,
            "attempting webhook delivery"
        );
        self.context
            .event_handler
            .handle_event(DeliveryEvent::AttemptStarted(DeliveryAttemptStartedEvent {
                attempt_id,
                event_id: event.id,
                account_id: event.account_id,
                subscription_id: subscription.id,
                attempt_number,
                started_at: now,
            }))
            .await;

        let started = std::time::Instant::now();
        let result = self.context.client.deliver(request).await;
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let attempt = attempt_record(&task, attempt_id, attempt_number, &result, now, latency_ms);
        storage.attempts.record(&attempt).await?;

        let finished_at = self.context.clock.now_utc();
        match result {
            Ok(response) => {
                self.on_success(
                    &task,
                    token,
                    &event,
                    attempt_id,
                    attempt_number,
                    &response,
                    finished_at,
                )
                .await
            },
            Err(error) => {
                self.on_failure(
                    &task,
                    token,
                    &event,
                    &subscription,
                    attempt_id,
                    attempt_number,
                    &error,
                    finished_at,
                )
                .await
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_success(
        &self,
        task: &DeliveryTask,
        token: Uuid,
        event: &Event,
        attempt_id: AttemptId,
        attempt_number: u32,
        response: &DeliveryResponse,
        now: DateTime<Utc>,
    ) -> Result<TaskOutcome> {
        let storage = &self.context.storage;

        if !storage.tasks.complete(task.id, token, attempt_number, now).await? {
            return self.lease_lost(task, event).await;
        }
        storage.events.record_outcome(event.id, OutcomeDelta::delivered()).await?;
        storage.subscriptions.record_success(task.subscription_id, now).await?;

        self.context.stats.write().await.successful_deliveries += 1;
        self.context
            .event_handler
            .handle_event(DeliveryEvent::Succeeded(DeliverySucceededEvent {
                attempt_id,
                event_id: event.id,
                account_id: event.account_id,
                subscription_id: task.subscription_id,
                status_code: response.status_code,
                attempt_number,
                latency_ms: u64::try_from(response.duration.as_millis()).unwrap_or(u64::MAX),
                delivered_at: now,
            }))
            .await;

        info!(
            worker_id = self.id,
            event_id = %event.id,
            subscription_id = %task.subscription_id,
            attempt = attempt_number,
            status_code = response.status_code,
            "webhook delivered"
        );
        Ok(TaskOutcome::Delivered)
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_failure(
        &self,
        task: &DeliveryTask,
        token: Uuid,
        event: &Event,
        subscription: &Subscription,
        attempt_id: AttemptId,
        attempt_number: u32,
        error: &DeliveryError,
        now: DateTime<Utc>,
    ) -> Result<TaskOutcome> {
        let storage = &self.context.storage;
        let reason = error.to_string();

        if storage.subscriptions.record_failure(subscription.id, &reason, now).await? {
            warn!(
                subscription_id = %subscription.id,
                failure_threshold = subscription.failure_threshold,
                "subscription disabled after consecutive failures"
            );
        }
        self.context.stats.write().await.failed_attempts += 1;

        let decision =
            RetryContext::new(attempt_number, error, now, &subscription.retry_policy).decide();
        let (will_retry, next_attempt_at) = match &decision {
            RetryDecision::Retry { next_attempt_at } => (true, Some(*next_attempt_at)),
            RetryDecision::GiveUp { .. } => (false, None),
        };

        let written = match decision {
            RetryDecision::Retry { next_attempt_at } => {
                storage
                    .tasks
                    .schedule_retry(task.id, token, attempt_number, next_attempt_at, &reason, now)
                    .await?
            },
            RetryDecision::GiveUp { .. } => {
                storage.tasks.mark_dead(task.id, token, attempt_number, &reason, now).await?
            },
        };
        if !written {
            return self.lease_lost(task, event).await;
        }

        self.context
            .event_handler
            .handle_event(DeliveryEvent::Failed(DeliveryFailedEvent {
                attempt_id,
                event_id: event.id,
                account_id: event.account_id,
                subscription_id: subscription.id,
                status_code: error.status_code(),
                attempt_number,
                error_message: reason.clone(),
                will_retry,
                next_attempt_at,
                failed_at: now,
            }))
            .await;

        if will_retry {
            storage.events.record_outcome(event.id, OutcomeDelta::retrying()).await?;
            debug!(
                event_id = %event.id,
                subscription_id = %subscription.id,
                attempt = attempt_number,
                next_attempt_at = ?next_attempt_at,
                "delivery rescheduled"
            );
            return Ok(TaskOutcome::Retrying);
        }

        // The outcome lands before the DLQ item is visible, so a DLQ retry
        // always reopens a failure that was already counted.
        storage.events.record_outcome(event.id, OutcomeDelta::dead_lettered()).await?;
        self.dead_letter(task, event, &reason, attempt_number, now).await?;
        Ok(TaskOutcome::DeadLettered)
    }

    /// Resolves a task whose subscription stopped being active.
    async fn cancel(
        &self,
        task: &DeliveryTask,
        token: Uuid,
        event: &Event,
        reason: &str,
    ) -> Result<TaskOutcome> {
        let storage = &self.context.storage;
        let now = self.context.clock.now_utc();

        if !storage.tasks.cancel_leased(task.id, token, reason, now).await? {
            return Ok(TaskOutcome::Skipped);
        }
        storage.events.record_outcome(event.id, OutcomeDelta::cancelled()).await?;
        self.dead_letter(task, event, reason, task.attempt_number, now).await?;
        self.context.stats.write().await.cancelled += 1;

        info!(
            event_id = %event.id,
            subscription_id = %task.subscription_id,
            reason,
            "delivery cancelled"
        );
        Ok(TaskOutcome::Cancelled)
    }

    async fn dead_letter(
        &self,
        task: &DeliveryTask,
        event: &Event,
        reason: &str,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let item = DlqItem {
            event_id: event.id,
            subscription_id: task.subscription_id,
            account_id: event.account_id,
            event_type: event.event_type.clone(),
            source: event.source.clone(),
            failure_reason: reason.to_string(),
            retry_count: task.dlq_retries,
            created_at: now,
        };
        self.context.storage.dead_letters.upsert(&item).await?;
        self.context.stats.write().await.dead_lettered += 1;

        self.context
            .event_handler
            .handle_event(DeliveryEvent::DeadLettered(DeliveryDeadLetteredEvent {
                event_id: event.id,
                account_id: event.account_id,
                subscription_id: task.subscription_id,
                attempts,
                reason: reason.to_string(),
                dead_lettered_at: now,
            }))
            .await;
        Ok(())
    }

    /// The call was made but another worker now owns the task; only the
    /// HTTP call is counted.
    async fn lease_lost(&self, task: &DeliveryTask, event: &Event) -> Result<TaskOutcome> {
        warn!(
            worker_id = self.id,
            task_id = %task.id,
            event_id = %event.id,
            "lease lost during delivery, result discarded"
        );
        let delta = OutcomeDelta { attempts: 1, ..OutcomeDelta::default() };
        self.context.storage.events.record_outcome(event.id, delta).await?;
        Ok(TaskOutcome::Skipped)
    }
}

fn attempt_record(
    task: &DeliveryTask,
    attempt_id: AttemptId,
    attempt_number: u32,
    result: &Result<DeliveryResponse>,
    attempted_at: DateTime<Utc>,
    latency_ms: u64,
) -> DeliveryAttempt {
    let (outcome, status_code, error_message, response_body) = match result {
        Ok(response) => {
            (AttemptOutcome::Success, Some(response.status_code), None, Some(response.body.clone()))
        },
        Err(error) => (
            error.attempt_outcome(),
            error.status_code(),
            Some(error.to_string()),
            error.response_body().map(str::to_string),
        ),
    };

    DeliveryAttempt {
        id: attempt_id,
        event_id: task.event_id,
        subscription_id: task.subscription_id,
        attempt_number,
        outcome,
        status_code,
        error_message,
        response_body,
        attempted_at,
        latency_ms,
    }
}
