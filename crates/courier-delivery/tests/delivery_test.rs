//! End-to-end delivery scenarios against a mock subscriber.
//!
//! The engine is driven inline with `run_once` and the shared test clock is
//! advanced between rounds, so retry schedules play out instantly.

use std::time::Duration;

use anyhow::{Context, Result};
use courier_core::{
    BackoffStrategy, Clock, EventStatus, RetryPolicy, SubscriptionStatus, TaskStatus,
};
use courier_delivery::{
    signing::{DEFAULT_TOLERANCE, SIGNATURE_HEADER, TIMESTAMP_HEADER},
    verify_signature, ReplayConfig, ReplayRequest,
};
use courier_testing::{fixtures::TEST_SECRET, Invariants, MockResponse, TestEnv, WEBHOOK_PATH};

/// Longer than the fixed 1 s backoff of test subscriptions.
const PAST_BACKOFF: Duration = Duration::from_secs(2);

fn header<'a>(request: &'a wiremock::Request, name: &str) -> Result<&'a str> {
    request
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .with_context(|| format!("missing header {name}"))
}

#[tokio::test]
async fn always_failing_subscriber_exhausts_into_one_dlq_item() -> Result<()> {
    let env = TestEnv::new().await?;
    env.http_mock.respond(WEBHOOK_PATH, MockResponse::Status(500)).await;
    let subscription = env.create_subscription(env.subscription().max_attempts(3)).await?;
    let event = env.insert_event(env.event_builder()).await?;

    let first = env.run_once().await?;
    assert_eq!(first.events_dispatched, 1);
    assert_eq!(first.tasks_processed, 1);
    assert_eq!(env.event(event.id).await?.status, EventStatus::Processing);

    for _ in 0..2 {
        env.advance(PAST_BACKOFF);
        assert_eq!(env.run_once().await?.tasks_processed, 1);
    }

    env.advance(Duration::from_secs(60));
    assert_eq!(env.run_once().await?.tasks_processed, 0);

    let attempts = env.attempts(event.id).await?;
    assert_eq!(attempts.iter().map(|a| a.attempt_number).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(attempts.iter().all(|a| a.status_code == Some(500)));
    Invariants::attempt_numbers_increase(&attempts)?;
    Invariants::attempts_within_budget(&attempts, 3)?;

    let items = env.dlq_items().await?;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].subscription_id, subscription.id);
    assert_eq!(items[0].retry_count, 0);
    Invariants::one_dlq_item_per_pair(&items)?;

    let stored = env.event(event.id).await?;
    assert_eq!(stored.status, EventStatus::Failed);
    assert_eq!(stored.delivery_attempts, 3);
    assert_eq!(stored.failed_deliveries, 1);
    Invariants::counters_consistent(&stored)?;

    assert_eq!(env.http_mock.requests_to(WEBHOOK_PATH).await.len(), 3);
    assert_eq!(env.engine().stats().await.dead_lettered, 1);
    Ok(())
}

#[tokio::test]
async fn dlq_retry_that_succeeds_removes_item_and_recomputes_status() -> Result<()> {
    let env = TestEnv::new().await?;
    env.http_mock.respond(WEBHOOK_PATH, MockResponse::Status(503)).await;
    env.create_subscription(env.subscription().max_attempts(1)).await?;
    let event = env.insert_event(env.event_builder()).await?;

    env.run_once().await?;
    assert_eq!(env.event(event.id).await?.status, EventStatus::Failed);
    assert_eq!(env.dlq_items().await?.len(), 1);

    env.http_mock.reset().await;
    env.http_mock.respond(WEBHOOK_PATH, MockResponse::Success).await;

    let outcome = env.dlq_manager().retry(env.account_id, event.id, None).await?;
    assert_eq!(outcome.requeued.len(), 1);
    assert!(env.dlq_items().await?.is_empty());

    let report = env.run_once().await?;
    assert_eq!(report.tasks_processed, 1);

    let stored = env.event(event.id).await?;
    assert_eq!(stored.status, EventStatus::Delivered);
    assert_eq!(stored.successful_deliveries, 1);
    assert_eq!(stored.failed_deliveries, 0);
    assert_eq!(stored.delivery_attempts, 2);
    Invariants::counters_consistent(&stored)?;
    Invariants::attempt_numbers_increase(&env.attempts(event.id).await?)?;

    let tasks = env.tasks(event.id).await?;
    assert_eq!(tasks[0].status, TaskStatus::Completed);
    assert_eq!(tasks[0].dlq_retries, 1);
    Ok(())
}

#[tokio::test]
async fn exhausted_failure_is_counted_before_the_dlq_item_exists() -> Result<()> {
    let env = TestEnv::new().await?;
    env.http_mock.respond(WEBHOOK_PATH, MockResponse::Status(500)).await;
    env.create_subscription(env.subscription().max_attempts(1)).await?;
    let event = env.insert_event(env.event_builder()).await?;

    env.store().set_rejecting_dead_letters(true);
    env.run_once().await?;

    let stored = env.event(event.id).await?;
    assert_eq!(stored.status, EventStatus::Failed);
    assert_eq!(stored.failed_deliveries, 1);
    assert!(env.dlq_items().await?.is_empty());
    assert_eq!(env.tasks(event.id).await?[0].status, TaskStatus::Dead);
    Ok(())
}

#[tokio::test]
async fn event_without_matching_subscription_is_delivered_without_attempts() -> Result<()> {
    let env = TestEnv::new().await?;
    env.create_subscription(env.subscription().event_types(["invoice.*"])).await?;
    let event = env.insert_event(env.event_builder().event_type("order.created")).await?;

    let report = env.run_once().await?;
    assert_eq!(report.events_dispatched, 1);
    assert_eq!(report.tasks_processed, 0);

    let stored = env.event(event.id).await?;
    assert_eq!(stored.status, EventStatus::Delivered);
    assert_eq!(stored.matched_subscriptions, 0);
    assert_eq!(stored.delivery_attempts, 0);
    assert!(stored.is_inbox_eligible());
    assert!(env.http_mock.requests_to(WEBHOOK_PATH).await.is_empty());
    Ok(())
}

#[tokio::test]
async fn paused_subscription_cancels_queued_delivery() -> Result<()> {
    let env = TestEnv::new().await?;
    env.http_mock.respond(WEBHOOK_PATH, MockResponse::Success).await;
    let mut subscription = env.create_subscription(env.subscription()).await?;
    let event = env.insert_event(env.event_builder()).await?;

    assert_eq!(env.engine().dispatch_pending().await?, 1);

    subscription.status = SubscriptionStatus::Paused;
    env.storage().subscriptions.upsert(&subscription).await?;

    assert_eq!(env.engine().process_batch().await?, 1);

    let items = env.dlq_items().await?;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].failure_reason, "subscription paused");

    let stored = env.event(event.id).await?;
    assert_eq!(stored.status, EventStatus::Failed);
    assert_eq!(stored.delivery_attempts, 0);
    assert_eq!(env.tasks(event.id).await?[0].status, TaskStatus::Cancelled);
    assert!(env.http_mock.requests_to(WEBHOOK_PATH).await.is_empty());
    Ok(())
}

#[tokio::test]
async fn webhook_requests_are_signed_and_identified() -> Result<()> {
    let env = TestEnv::new().await?;
    env.http_mock.respond(WEBHOOK_PATH, MockResponse::Success).await;
    let subscription =
        env.create_subscription(env.subscription().header("X-Tenant", "acme")).await?;
    let event = env.insert_event(env.event_builder()).await?;

    env.run_once().await?;

    let requests = env.http_mock.requests_to(WEBHOOK_PATH).await;
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    verify_signature(
        TEST_SECRET,
        header(request, TIMESTAMP_HEADER)?,
        &request.body,
        header(request, SIGNATURE_HEADER)?,
        env.clock.now_utc(),
        DEFAULT_TOLERANCE,
    )?;
    assert_eq!(header(request, "X-Event-Id")?, event.id.to_string());
    assert_eq!(header(request, "X-Subscription-Id")?, subscription.id.to_string());
    assert_eq!(header(request, "X-Delivery-Attempt")?, "1");
    assert_eq!(header(request, "X-Tenant")?, "acme");

    let body: serde_json::Value = serde_json::from_slice(&request.body)?;
    assert_eq!(body["id"], serde_json::json!(event.id));
    assert_eq!(body["type"], "order.created");
    Ok(())
}

#[tokio::test]
async fn one_failing_subscriber_does_not_hold_back_the_others() -> Result<()> {
    let env = TestEnv::new().await?;
    env.http_mock.respond("/healthy", MockResponse::Success).await;
    env.http_mock.respond("/broken", MockResponse::Status(500)).await;
    env.create_subscription(env.subscription().url(env.webhook_url("/healthy"))).await?;
    env.create_subscription(env.subscription().url(env.webhook_url("/broken")).max_attempts(2))
        .await?;
    let event = env.insert_event(env.event_builder()).await?;

    env.run_once().await?;
    let stored = env.event(event.id).await?;
    assert_eq!(stored.status, EventStatus::Processing);
    assert_eq!(stored.successful_deliveries, 1);

    env.advance(PAST_BACKOFF);
    env.run_once().await?;

    let stored = env.event(event.id).await?;
    assert_eq!(stored.status, EventStatus::PartiallyDelivered);
    assert_eq!(stored.matched_subscriptions, 2);
    assert_eq!(stored.delivery_attempts, 3);
    assert_eq!(env.http_mock.requests_to("/healthy").await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn retry_after_is_honoured_as_a_floor() -> Result<()> {
    let env = TestEnv::new().await?;
    env.http_mock.respond(WEBHOOK_PATH, MockResponse::RateLimited { retry_after_secs: 120 }).await;
    let policy = RetryPolicy {
        max_attempts: 5,
        initial_delay_ms: 1_000,
        max_delay_ms: 600_000,
        multiplier: 2.0,
        strategy: BackoffStrategy::Fixed,
        jitter_factor: 0.0,
    };
    env.create_subscription(env.subscription().retry_policy(policy)).await?;
    let event = env.insert_event(env.event_builder()).await?;

    env.run_once().await?;

    let task = env.tasks(event.id).await?.remove(0);
    assert_eq!(task.status, TaskStatus::Queued);
    let delay = task.next_attempt_at - env.clock.now_utc();
    assert!(delay >= chrono::Duration::seconds(120), "retry scheduled after {delay}");

    env.advance(Duration::from_secs(60));
    assert_eq!(env.run_once().await?.tasks_processed, 0);
    env.advance(Duration::from_secs(61));
    assert_eq!(env.run_once().await?.tasks_processed, 1);
    Ok(())
}

#[tokio::test]
async fn replay_delivers_a_linked_copy_to_current_subscribers() -> Result<()> {
    let env = TestEnv::new().await?;
    env.http_mock.respond(WEBHOOK_PATH, MockResponse::Success).await;
    env.create_subscription(env.subscription()).await?;
    let original = env.insert_event(env.event_builder()).await?;
    env.run_until_idle().await?;

    let result = env
        .replay_engine(ReplayConfig::default())
        .replay(env.account_id, original.id, ReplayRequest::default())
        .await?;
    let replay_id = result.replay_event_id.context("replay event id")?;

    env.run_until_idle().await?;

    let replay = env.event(replay_id).await?;
    assert_eq!(replay.status, EventStatus::Delivered);
    assert_eq!(replay.replay_of, Some(original.id));

    let original = env.event(original.id).await?;
    assert_eq!(original.replay_count, 1);
    assert_eq!(original.delivery_attempts, 1);

    let requests = env.http_mock.requests_to(WEBHOOK_PATH).await;
    assert_eq!(requests.len(), 2);
    assert_eq!(header(&requests[1], "X-Event-Id")?, replay_id.to_string());
    Ok(())
}
