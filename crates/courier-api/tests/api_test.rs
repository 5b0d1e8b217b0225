use anyhow::Result;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    response::Response,
    Router,
};
use courier_api::{create_router, ApiSettings, AppState, IngestLimits};
use courier_core::Scope;
use courier_delivery::ReplayConfig;
use courier_testing::{MockResponse, TestEnv, WEBHOOK_PATH};
use serde_json::{json, Value};
use tower::ServiceExt;

fn router(env: &TestEnv, settings: ApiSettings) -> Router {
    create_router(AppState::new(
        env.storage().clone(),
        env.clock_handle(),
        settings,
        env.engine().dispatch_wakeup(),
        env.engine().delivery_wakeup(),
    ))
}

async fn send(app: &Router, request: Request<Body>) -> Result<Response> {
    Ok(app.clone().oneshot(request).await?)
}

async fn body_json(response: Response) -> Result<Value> {
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn get(uri: &str, key: &str) -> Result<Request<Body>> {
    Ok(Request::get(uri).header("authorization", format!("Bearer {key}")).body(Body::empty())?)
}

fn post_json(uri: &str, key: &str, body: &Value) -> Result<Request<Body>> {
    Ok(Request::post(uri)
        .header("authorization", format!("Bearer {key}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))?)
}

fn order_created() -> Value {
    json!({"type": "order.created", "source": "shop", "data": {"order_id": 42}})
}

#[tokio::test]
async fn requests_without_valid_key_are_rejected() -> Result<()> {
    let env = TestEnv::new().await?;
    let app = router(&env, ApiSettings::default());

    let response = send(&app, Request::get("/events").body(Body::empty())?).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await?["error"]["code"], "unauthorized");

    let response = send(&app, get("/events", "ck_unknown")?).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = send(&app, Request::get("/health/live").body(Body::empty())?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn missing_scope_is_forbidden() -> Result<()> {
    let env = TestEnv::new().await?;
    let app = router(&env, ApiSettings::default());
    let (key, _) = env.create_api_key(&[Scope::EventsRead]).await?;

    let response = send(&app, post_json("/events", &key, &order_created())?).await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await?["error"]["code"], "forbidden");

    let response = send(&app, get("/dlq", &key)?).await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    Ok(())
}

#[tokio::test]
async fn idempotent_create_returns_original_event() -> Result<()> {
    let env = TestEnv::new().await?;
    let app = router(&env, ApiSettings::default());
    let (key, _) = env.create_api_key(&[Scope::EventsWrite]).await?;

    let request = || -> Result<Request<Body>> {
        Ok(Request::post("/events")
            .header("authorization", format!("Bearer {key}"))
            .header("x-idempotency-key", "order-42")
            .body(Body::from(order_created().to_string()))?)
    };

    let first = send(&app, request()?).await?;
    assert_eq!(first.status(), StatusCode::CREATED);
    assert!(first.headers().contains_key("x-ratelimit-remaining"));
    let first = body_json(first).await?;

    let second = send(&app, request()?).await?;
    assert_eq!(second.status(), StatusCode::OK);
    let second = body_json(second).await?;

    assert_eq!(first["id"], second["id"]);
    assert_eq!(first["type"], "order.created");
    assert_eq!(first["metadata"]["idempotency_key"], "order-42");
    Ok(())
}

#[tokio::test]
async fn invalid_and_oversized_events_are_rejected() -> Result<()> {
    let env = TestEnv::new().await?;
    let settings = ApiSettings {
        ingest: IngestLimits { max_event_bytes: 1024, ..IngestLimits::default() },
        ..ApiSettings::default()
    };
    let app = router(&env, settings);
    let (key, _) = env.create_api_key(&[Scope::EventsWrite]).await?;

    let response = send(
        &app,
        post_json("/events", &key, &json!({"type": "bad type!", "source": "shop", "data": {}}))?,
    )
    .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await?;
    assert_eq!(body["error"]["code"], "validation_error");
    assert_eq!(body["error"]["field"], "type");

    let response = send(
        &app,
        post_json(
            "/events",
            &key,
            &json!({"type": "order.created", "source": "shop", "data": {"blob": "x".repeat(2048)}}),
        )?,
    )
    .await?;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

    let response = send(
        &app,
        post_json(
            "/events",
            &key,
            &json!({"type": "order.created", "source": "shop", "data": {"blob": "x".repeat(80_000)}}),
        )?,
    )
    .await?;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body_json(response).await?["error"]["code"], "payload_too_large");

    let response = send(
        &app,
        Request::post("/events")
            .header("authorization", format!("Bearer {key}"))
            .body(Body::from("{not json"))?,
    )
    .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn exhausted_rate_limit_returns_429_with_headers() -> Result<()> {
    let env = TestEnv::new().await?;
    let app = router(&env, ApiSettings::default());
    let (key, mut credential) = env.create_api_key(&[Scope::EventsWrite]).await?;
    credential.requests_per_minute = Some(1);
    env.storage().credentials.upsert(&credential).await?;

    let first = send(&app, post_json("/events", &key, &order_created())?).await?;
    assert_eq!(first.status(), StatusCode::CREATED);

    let second = send(&app, post_json("/events", &key, &order_created())?).await?;
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(second.headers()["x-ratelimit-limit"], "1");
    assert_eq!(second.headers()["x-ratelimit-remaining"], "0");
    assert!(second.headers().contains_key("retry-after"));
    assert_eq!(body_json(second).await?["error"]["code"], "rate_limited");
    Ok(())
}

#[tokio::test]
async fn batch_reports_each_entry() -> Result<()> {
    let env = TestEnv::new().await?;
    let app = router(&env, ApiSettings::default());
    let (key, _) = env.create_api_key(&[Scope::EventsWrite]).await?;

    let batch = json!({
        "events": [
            {"reference_id": "a", "type": "order.created", "source": "shop", "data": {}},
            {"reference_id": "b", "type": "", "source": "shop", "data": {}},
        ]
    });
    let response = send(&app, post_json("/events/batch", &key, &batch)?).await?;
    assert_eq!(response.status(), StatusCode::OK);

    let summary = body_json(response).await?;
    assert_eq!(summary["total"], 2);
    assert_eq!(summary["successful"], 1);
    assert_eq!(summary["failed"], 1);
    assert_eq!(summary["results"][0]["reference_id"], "a");
    assert_eq!(summary["results"][1]["error"]["code"], "validation_error");
    assert_eq!(summary["results"][1]["error"]["field"], "type");
    Ok(())
}

#[tokio::test]
async fn event_detail_shows_deliveries() -> Result<()> {
    let env = TestEnv::new().await?;
    env.http_mock.respond(WEBHOOK_PATH, MockResponse::Success).await;
    env.create_subscription(env.subscription()).await?;
    let app = router(&env, ApiSettings::default());
    let (key, _) = env.create_api_key(&[Scope::EventsWrite, Scope::EventsRead]).await?;

    let created = body_json(send(&app, post_json("/events", &key, &order_created())?).await?).await?;
    let event_id = created["id"].as_str().unwrap_or_default().to_string();
    env.run_until_idle().await?;

    let response = send(&app, get(&format!("/events/{event_id}"), &key)?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let detail = body_json(response).await?;

    assert_eq!(detail["status"], "delivered");
    assert_eq!(detail["deliveries"][0]["status"], "completed");
    assert_eq!(detail["attempts"].as_array().map(Vec::len), Some(1));

    let missing = send(&app, get(&format!("/events/{}", uuid_like()), &key)?).await?;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(missing).await?["error"]["code"], "event_not_found");
    Ok(())
}

fn uuid_like() -> &'static str {
    "0190a6d2-0000-7000-8000-00000000ffff"
}

#[tokio::test]
async fn events_list_pages_with_cursor() -> Result<()> {
    let env = TestEnv::new().await?;
    let app = router(&env, ApiSettings::default());
    let (key, _) = env.create_api_key(&[Scope::EventsWrite, Scope::EventsRead]).await?;

    for _ in 0..3 {
        send(&app, post_json("/events", &key, &order_created())?).await?;
        env.advance(std::time::Duration::from_secs(1));
    }

    let first = body_json(send(&app, get("/events?limit=2", &key)?).await?).await?;
    assert_eq!(first["events"].as_array().map(Vec::len), Some(2));
    assert_eq!(first["has_more"], true);

    let cursor = first["next_cursor"].as_str().unwrap_or_default().to_string();
    let second =
        body_json(send(&app, get(&format!("/events?limit=2&cursor={cursor}"), &key)?).await?)
            .await?;
    assert_eq!(second["events"].as_array().map(Vec::len), Some(1));
    assert_eq!(second["has_more"], false);
    Ok(())
}

#[tokio::test]
async fn inbox_acknowledges_each_handle_once() -> Result<()> {
    let env = TestEnv::new().await?;
    let app = router(&env, ApiSettings::default());
    let (key, _) = env.create_api_key(&[Scope::EventsWrite, Scope::EventsRead]).await?;
    send(&app, post_json("/events", &key, &order_created())?).await?;

    let page = body_json(send(&app, get("/inbox?visibility_timeout=60", &key)?).await?).await?;
    let handle = page["events"][0]["receipt_handle"].as_str().unwrap_or_default().to_string();
    assert!(!handle.is_empty());

    let hidden = body_json(send(&app, get("/inbox", &key)?).await?).await?;
    assert_eq!(hidden["events"].as_array().map(Vec::len), Some(0));

    let ack = json!({"receipt_handles": [handle]});
    let first = body_json(send(&app, post_json("/inbox/ack", &key, &ack)?).await?).await?;
    assert_eq!(first["acknowledged"], 1);

    let second = body_json(send(&app, post_json("/inbox/ack", &key, &ack)?).await?).await?;
    assert_eq!(second["acknowledged"], 0);
    assert_eq!(second["results"][0]["acknowledged"], false);

    env.advance(std::time::Duration::from_secs(120));
    let after = body_json(send(&app, get("/inbox", &key)?).await?).await?;
    assert_eq!(after["events"].as_array().map(Vec::len), Some(0));

    let empty = send(&app, post_json("/inbox/ack", &key, &json!({"receipt_handles": []}))?).await?;
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn dlq_operations_on_unknown_event_are_not_found() -> Result<()> {
    let env = TestEnv::new().await?;
    let app = router(&env, ApiSettings::default());
    let (key, _) = env.create_api_key(&[Scope::DlqManage]).await?;

    let retry = send(
        &app,
        Request::post(format!("/dlq/{}/retry", uuid_like()))
            .header("authorization", format!("Bearer {key}"))
            .body(Body::empty())?,
    )
    .await?;
    assert_eq!(retry.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(retry).await?["error"]["code"], "dlq_item_not_found");

    let dismiss = send(
        &app,
        Request::delete(format!("/dlq/{}", uuid_like()))
            .header("authorization", format!("Bearer {key}"))
            .body(Body::empty())?,
    )
    .await?;
    assert_eq!(dismiss.status(), StatusCode::NOT_FOUND);

    let stats = send(&app, get("/dlq/stats", &key)?).await?;
    assert_eq!(stats.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn replay_stops_at_cap() -> Result<()> {
    let env = TestEnv::new().await?;
    let settings = ApiSettings {
        replay: ReplayConfig { enabled: true, max_replays: 1 },
        ..ApiSettings::default()
    };
    let app = router(&env, settings);
    let (key, _) = env.create_api_key(&[Scope::DlqManage]).await?;
    let event = env.insert_event(env.event_builder()).await?;
    let uri = format!("/events/{}/replay", event.id);

    let dry_run = send(&app, post_json(&uri, &key, &json!({"dry_run": true}))?).await?;
    assert_eq!(dry_run.status(), StatusCode::OK);

    let first = send(&app, post_json(&uri, &key, &json!({}))?).await?;
    assert_eq!(first.status(), StatusCode::CREATED);
    let first = body_json(first).await?;
    assert_eq!(first["replays_remaining"], 0);
    assert!(first["replay_event_id"].is_string());

    let second = send(&app, post_json(&uri, &key, &json!({}))?).await?;
    assert_eq!(second.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(second).await?["error"]["code"], "replay_limit_exceeded");
    Ok(())
}

#[tokio::test]
async fn health_reports_storage_outage() -> Result<()> {
    let env = TestEnv::new().await?;
    let app = router(&env, ApiSettings::default());

    let healthy = send(&app, Request::get("/health").body(Body::empty())?).await?;
    assert_eq!(healthy.status(), StatusCode::OK);
    assert_eq!(body_json(healthy).await?["checks"]["storage"]["backend"], "memory");

    env.store().set_unavailable(true);

    let health = send(&app, Request::get("/health").body(Body::empty())?).await?;
    assert_eq!(health.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(health).await?["status"], "unhealthy");

    let ready = send(&app, Request::get("/health/ready").body(Body::empty())?).await?;
    assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);

    let live = send(&app, Request::get("/health/live").body(Body::empty())?).await?;
    assert_eq!(live.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn request_id_is_echoed_or_assigned() -> Result<()> {
    let env = TestEnv::new().await?;
    let app = router(&env, ApiSettings::default());

    let echoed = send(
        &app,
        Request::get("/health/live").header("x-request-id", "req-123").body(Body::empty())?,
    )
    .await?;
    assert_eq!(echoed.headers()["x-request-id"], "req-123");

    let assigned = send(&app, Request::get("/health/live").body(Body::empty())?).await?;
    assert!(assigned.headers().get("x-request-id").is_some_and(|v| !v.is_empty()));
    Ok(())
}
