//! Full request paths: HTTP ingestion through delivery, dead-lettering and
//! recovery, driven against the in-memory store and a mock subscriber.

use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    body::{to_bytes, Body},
    Router,
};
use courier_api::{create_router, ApiSettings, AppState};
use courier_core::{Clock, EventStatus, Scope};
use courier_delivery::{
    signing::{DEFAULT_TOLERANCE, SIGNATURE_HEADER, TIMESTAMP_HEADER},
    verify_signature,
};
use courier_testing::{fixtures::TEST_SECRET, Invariants, MockResponse, TestEnv, WEBHOOK_PATH};
use http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

fn router(env: &TestEnv) -> Router {
    create_router(AppState::new(
        env.storage().clone(),
        env.clock_handle(),
        ApiSettings::default(),
        env.engine().dispatch_wakeup(),
        env.engine().delivery_wakeup(),
    ))
}

async fn call(
    app: &Router,
    method: &str,
    uri: &str,
    key: &str,
    body: Option<Value>,
) -> Result<(StatusCode, Value)> {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {key}"))
        .header("content-type", "application/json")
        .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))?;

    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    let json = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes)? };
    Ok((status, json))
}

fn event_id(body: &Value) -> Result<String> {
    body["id"].as_str().map(str::to_string).context("response has no event id")
}

#[tokio::test]
async fn ingested_event_is_delivered_signed() -> Result<()> {
    let env = TestEnv::new().await?;
    env.http_mock.respond(WEBHOOK_PATH, MockResponse::Success).await;
    env.create_subscription(env.subscription().event_types(["order.*"])).await?;
    let app = router(&env);
    let (key, _) = env.create_api_key(&[Scope::EventsWrite, Scope::EventsRead]).await?;

    let (status, created) = call(
        &app,
        "POST",
        "/events",
        &key,
        Some(json!({"type": "order.created", "source": "shop", "data": {"order_id": 7}})),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "pending");

    assert_eq!(env.run_until_idle().await?, 1);

    let requests = env.http_mock.requests_to(WEBHOOK_PATH).await;
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    let header = |name: &str| -> Result<String> {
        request
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .with_context(|| format!("missing header {name}"))
    };
    verify_signature(
        TEST_SECRET,
        &header(TIMESTAMP_HEADER)?,
        &request.body,
        &header(SIGNATURE_HEADER)?,
        env.clock.now_utc(),
        DEFAULT_TOLERANCE,
    )?;
    assert_eq!(header("X-Event-Id")?, event_id(&created)?);

    let delivered: Value = serde_json::from_slice(&request.body)?;
    assert_eq!(delivered["data"]["order_id"], 7);

    let detail_uri = format!("/events/{}", event_id(&created)?);
    let (_, detail) = call(&app, "GET", &detail_uri, &key, None).await?;
    assert_eq!(detail["status"], "delivered");
    assert_eq!(detail["successful_deliveries"], 1);
    Ok(())
}

#[tokio::test]
async fn dead_lettered_delivery_recovers_through_the_api() -> Result<()> {
    let env = TestEnv::new().await?;
    env.http_mock.respond(WEBHOOK_PATH, MockResponse::Status(500)).await;
    let subscription = env.create_subscription(env.subscription().max_attempts(2)).await?;
    let app = router(&env);
    let (key, _) =
        env.create_api_key(&[Scope::EventsWrite, Scope::EventsRead, Scope::DlqManage]).await?;

    let (_, created) = call(
        &app,
        "POST",
        "/events",
        &key,
        Some(json!({"type": "invoice.paid", "source": "billing", "data": {}})),
    )
    .await?;
    let id = event_id(&created)?;

    env.run_once().await?;
    env.advance(Duration::from_secs(2));
    env.run_once().await?;

    let (status, page) = call(&app, "GET", "/dlq", &key, None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 1);
    assert_eq!(page["items"][0]["event_id"], id.as_str());
    assert_eq!(page["items"][0]["subscription_id"], subscription.id.to_string());

    let (_, stats) = call(&app, "GET", "/dlq/stats", &key, None).await?;
    assert_eq!(stats["total"], 1);

    env.http_mock.reset().await;
    env.http_mock.respond(WEBHOOK_PATH, MockResponse::Success).await;

    let (status, outcome) = call(&app, "POST", &format!("/dlq/{id}/retry"), &key, None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["requeued"].as_array().map(Vec::len), Some(1));

    env.run_until_idle().await?;

    let (_, detail) = call(&app, "GET", &format!("/events/{id}"), &key, None).await?;
    assert_eq!(detail["status"], "delivered");
    assert_eq!(detail["deliveries"][0]["dlq_retries"], 1);
    assert_eq!(detail["attempts"].as_array().map(Vec::len), Some(3));

    let stored = env.event(id.parse()?).await?;
    assert_eq!(stored.status, EventStatus::Delivered);
    Invariants::counters_consistent(&stored)?;

    let (_, page) = call(&app, "GET", "/dlq", &key, None).await?;
    assert_eq!(page["total"], 0);
    Ok(())
}

#[tokio::test]
async fn replayed_event_is_delivered_again() -> Result<()> {
    let env = TestEnv::new().await?;
    env.http_mock.respond(WEBHOOK_PATH, MockResponse::Success).await;
    env.create_subscription(env.subscription()).await?;
    let app = router(&env);
    let (key, _) = env.create_api_key(&[Scope::EventsWrite, Scope::DlqManage]).await?;

    let (_, created) = call(
        &app,
        "POST",
        "/events",
        &key,
        Some(json!({"type": "user.signup", "source": "auth", "data": {"plan": "free"}})),
    )
    .await?;
    env.run_until_idle().await?;

    let (status, replay) = call(
        &app,
        "POST",
        &format!("/events/{}/replay", event_id(&created)?),
        &key,
        Some(json!({"payload_override": {"plan": "pro"}})),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    let replay_id = replay["replay_event_id"].as_str().context("no replay id")?.to_string();

    env.run_until_idle().await?;

    let requests = env.http_mock.requests_to(WEBHOOK_PATH).await;
    assert_eq!(requests.len(), 2);
    let second: Value = serde_json::from_slice(&requests[1].body)?;
    assert_eq!(second["data"]["plan"], "pro");

    let replayed = env.event(replay_id.parse()?).await?;
    assert_eq!(replayed.replay_of.map(|id| id.to_string()), Some(event_id(&created)?));
    assert_eq!(replayed.status, EventStatus::Delivered);
    Ok(())
}
