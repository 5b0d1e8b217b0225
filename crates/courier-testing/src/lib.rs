//! Test infrastructure for deterministic end-to-end testing.
//!
//! [`TestEnv`] wires an in-memory store, a manual [`TestClock`], a wiremock
//! subscriber and the production [`DeliveryEngine`] together. Tests drive
//! the engine inline with [`TestEnv::run_once`] and move time forward with
//! [`TestEnv::advance`], so retry schedules play out without sleeping.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_core::{
    storage::{DlqQuery, MemoryStore},
    AccountId, Clock, Credential, CredentialId, DeliveryAttempt, DeliveryTask, DlqItem, Event,
    EventId, Scope, Storage, Subscription,
};
use courier_delivery::{
    ClientConfig, DeliveryConfig, DeliveryEngine, DlqManager, ReplayConfig, ReplayEngine,
    RunReport,
};

pub mod fixtures;
pub mod http;
pub mod invariants;

pub use courier_core::TestClock;
pub use fixtures::{EventBuilder, SubscriptionBuilder};
pub use http::{MockResponse, MockServer};
pub use invariants::Invariants;

/// Rounds `run_until_idle` runs before giving up.
const MAX_IDLE_ROUNDS: usize = 50;

/// Path every default subscription points at on the mock server.
pub const WEBHOOK_PATH: &str = "/webhook";

/// Isolated environment for one test.
pub struct TestEnv {
    /// Subscriber endpoint.
    pub http_mock: MockServer,
    /// Manual clock shared with the engine.
    pub clock: TestClock,
    /// Account that fixtures default to.
    pub account_id: AccountId,
    store: Arc<MemoryStore>,
    storage: Storage,
    engine: DeliveryEngine,
}

/// Builder for [`TestEnv`].
#[derive(Debug, Clone)]
pub struct TestEnvBuilder {
    delivery_config: DeliveryConfig,
}

impl TestEnvBuilder {
    /// Overrides the delivery engine configuration.
    #[must_use]
    pub fn delivery_config(mut self, config: DeliveryConfig) -> Self {
        self.delivery_config = config;
        self
    }

    /// Sets the HTTP timeout of the delivery client.
    #[must_use]
    pub fn client_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_config.client_config.timeout = timeout;
        self
    }

    /// Builds the environment and starts the mock subscriber.
    ///
    /// # Errors
    ///
    /// Returns an error if the delivery engine cannot be constructed.
    pub async fn build(self) -> Result<TestEnv> {
        let http_mock = MockServer::start().await;
        let clock = TestClock::new();
        let store = Arc::new(MemoryStore::new());
        let storage = Storage::from_memory(store.clone());
        let engine =
            DeliveryEngine::new(storage.clone(), self.delivery_config, Arc::new(clock.clone()))
                .context("failed to build delivery engine")?;

        Ok(TestEnv { http_mock, clock, account_id: AccountId::new(), store, storage, engine })
    }
}

impl Default for TestEnvBuilder {
    fn default() -> Self {
        Self {
            delivery_config: DeliveryConfig {
                worker_count: 1,
                batch_size: 50,
                client_config: ClientConfig {
                    timeout: Duration::from_secs(5),
                    ..ClientConfig::default()
                },
                ..DeliveryConfig::default()
            },
        }
    }
}

impl TestEnv {
    /// Creates an environment with test defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the delivery engine cannot be constructed.
    pub async fn new() -> Result<Self> {
        Self::builder().build().await
    }

    /// Starts building a customised environment.
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::default()
    }

    /// Repository handles over the in-memory store.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// The in-memory store, for fault injection.
    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// The production delivery engine.
    pub fn engine(&self) -> &DeliveryEngine {
        &self.engine
    }

    /// The environment clock as a trait object.
    pub fn clock_handle(&self) -> Arc<dyn Clock> {
        Arc::new(self.clock.clone())
    }

    /// DLQ manager wired to the engine's delivery wakeup.
    pub fn dlq_manager(&self) -> DlqManager {
        DlqManager::new(self.storage.clone(), self.clock_handle(), self.engine.delivery_wakeup())
    }

    /// Replay engine wired to the engine's dispatch wakeup.
    pub fn replay_engine(&self, config: ReplayConfig) -> ReplayEngine {
        ReplayEngine::new(
            self.storage.clone(),
            self.clock_handle(),
            config,
            self.engine.dispatch_wakeup(),
        )
    }

    /// Full URL of `path` on the mock subscriber.
    pub fn webhook_url(&self, path: &str) -> String {
        self.http_mock.endpoint(path)
    }

    /// Subscription builder pointing at [`WEBHOOK_PATH`] in this account.
    pub fn subscription(&self) -> SubscriptionBuilder {
        SubscriptionBuilder::new(self.account_id, self.webhook_url(WEBHOOK_PATH))
    }

    /// Event builder in this account.
    pub fn event_builder(&self) -> EventBuilder {
        EventBuilder::new(self.account_id)
    }

    /// Stores a subscription built at the current test time.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the write.
    pub async fn create_subscription(&self, builder: SubscriptionBuilder) -> Result<Subscription> {
        let subscription = builder.build(self.clock.now_utc());
        self.storage.subscriptions.upsert(&subscription).await?;
        Ok(subscription)
    }

    /// Stores a pending event built at the current test time, bypassing
    /// ingestion.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the write.
    pub async fn insert_event(&self, builder: EventBuilder) -> Result<Event> {
        let event = builder.build(self.clock.now_utc());
        self.storage.events.insert(&event).await?;
        Ok(event)
    }

    /// Issues an API key for this account and stores its credential.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the write.
    pub async fn create_api_key(&self, scopes: &[Scope]) -> Result<(String, Credential)> {
        let key = format!("ck_test_{}", uuid::Uuid::new_v4().simple());
        let credential = Credential {
            id: CredentialId::new(),
            account_id: self.account_id,
            name: "test".to_string(),
            key_hash: sha256::digest(key.as_str()),
            scopes: scopes.to_vec(),
            requests_per_minute: None,
            revoked_at: None,
            created_at: self.clock.now_utc(),
        };
        self.storage.credentials.upsert(&credential).await?;
        Ok((key, credential))
    }

    /// Moves the shared clock forward.
    pub fn advance(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    /// Runs one dispatch round and one delivery batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot claim work.
    pub async fn run_once(&self) -> Result<RunReport> {
        let report = self.engine.run_once().await.context("engine round failed")?;
        tracing::debug!(
            events_dispatched = report.events_dispatched,
            tasks_processed = report.tasks_processed,
            "engine round completed"
        );
        Ok(report)
    }

    /// Runs rounds until one finds no work, without moving the clock.
    ///
    /// Returns the number of tasks processed.
    ///
    /// # Errors
    ///
    /// Returns an error if a round fails or work never drains.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut processed = 0;
        for _ in 0..MAX_IDLE_ROUNDS {
            let report = self.run_once().await?;
            if report.events_dispatched == 0 && report.tasks_processed == 0 {
                return Ok(processed);
            }
            processed += report.tasks_processed;
        }
        anyhow::bail!("engine still busy after {MAX_IDLE_ROUNDS} rounds")
    }

    /// Loads an event that must exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the event is missing.
    pub async fn event(&self, id: EventId) -> Result<Event> {
        self.storage.events.find(id).await?.with_context(|| format!("event {id} not found"))
    }

    /// Attempts recorded for an event, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn attempts(&self, id: EventId) -> Result<Vec<DeliveryAttempt>> {
        Ok(self.storage.attempts.list_for_event(id).await?)
    }

    /// Delivery tasks of an event.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn tasks(&self, id: EventId) -> Result<Vec<DeliveryTask>> {
        Ok(self.storage.tasks.list_for_event(id).await?)
    }

    /// Every DLQ item of this account, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn dlq_items(&self) -> Result<Vec<DlqItem>> {
        let query = DlqQuery { limit: 100, ..DlqQuery::default() };
        Ok(self.storage.dead_letters.list(self.account_id, &query).await?.items)
    }
}
