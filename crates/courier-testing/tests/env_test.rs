use std::time::Duration;

use anyhow::Result;
use courier_core::{Clock, EventStatus, Scope};
use courier_testing::{MockResponse, TestEnv, WEBHOOK_PATH};

#[tokio::test]
async fn environment_starts_with_empty_store() -> Result<()> {
    let env = TestEnv::new().await?;

    assert_eq!(env.storage().backend_name(), "memory");
    assert!(env.dlq_items().await?.is_empty());
    assert_eq!(env.run_until_idle().await?, 0);
    Ok(())
}

#[tokio::test]
async fn clock_is_shared_with_fixtures() -> Result<()> {
    let env = TestEnv::new().await?;
    let before = env.clock.now_utc();

    env.advance(Duration::from_secs(3600));
    let event = env.insert_event(env.event_builder()).await?;

    assert!(event.created_at >= before + chrono::Duration::seconds(3600));
    assert_eq!(env.event(event.id).await?.status, EventStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn response_sequence_replays_in_order() -> Result<()> {
    let env = TestEnv::new().await?;
    env.http_mock
        .respond_sequence(WEBHOOK_PATH, &[MockResponse::Status(500), MockResponse::Success])
        .await;
    env.create_subscription(env.subscription()).await?;
    let event = env.insert_event(env.event_builder()).await?;

    env.run_once().await?;
    env.advance(Duration::from_secs(2));
    env.run_once().await?;

    let attempts = env.attempts(event.id).await?;
    assert_eq!(attempts.iter().map(|a| a.status_code).collect::<Vec<_>>(), vec![
        Some(500),
        Some(200)
    ]);
    assert_eq!(env.event(event.id).await?.status, EventStatus::Delivered);
    Ok(())
}

#[tokio::test]
async fn api_keys_are_stored_by_digest() -> Result<()> {
    let env = TestEnv::new().await?;
    let (key, credential) = env.create_api_key(&[Scope::EventsWrite]).await?;

    let found = env.storage().credentials.find_by_key_hash(&sha256::digest(key.as_str())).await?;
    assert_eq!(found.map(|c| c.id), Some(credential.id));
    Ok(())
}
