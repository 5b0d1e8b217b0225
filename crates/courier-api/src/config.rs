//! Configuration management for the courier service.

use std::{collections::BTreeMap, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use courier_core::{
    AccountId, BackoffStrategy, Credential, CredentialId, EventFilter, InboxConfig, RateLimitTier,
    RetryPolicy, Scope, Storage, Subscription, SubscriptionId, SubscriptionStatus,
};
use courier_delivery::{ClientConfig, DeliveryConfig, DispatcherConfig, ReplayConfig};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{ingest::IngestLimits, state::ApiSettings};

const CONFIG_FILE: &str = "config.toml";

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-process maps; state is lost on restart.
    Memory,
    /// PostgreSQL via `database_url`.
    Postgres,
}

/// API key seeded into the credential store at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    /// The raw key; only its SHA-256 digest is stored.
    pub key: String,
    /// Account the key acts for.
    pub account_id: AccountId,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Granted scopes.
    pub scopes: Vec<Scope>,
    /// Per-key rate limit; the default tier applies when unset.
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
}

/// Subscription seeded into the store at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Stable identifier, so restarts update rather than duplicate.
    pub id: SubscriptionId,
    /// Owning account.
    pub account_id: AccountId,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Destination URL.
    pub url: String,
    /// HMAC signing secret.
    pub secret: String,
    /// Type globs; every type when empty.
    #[serde(default)]
    pub event_types: Vec<String>,
    /// Sources; every source when empty.
    #[serde(default)]
    pub sources: Vec<String>,
    /// Attempt budget; the global retry policy applies when unset.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// HTTP timeout in seconds.
    #[serde(default)]
    pub timeout_seconds: Option<u32>,
    /// Consecutive failures before the subscription disables itself.
    #[serde(default)]
    pub failure_threshold: Option<u32>,
    /// Extra request headers.
    #[serde(default)]
    pub custom_headers: BTreeMap<String, String>,
}

/// What [`Config::seed_storage`] wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    /// Credentials upserted.
    pub api_keys: usize,
    /// Subscriptions upserted.
    pub subscriptions: usize,
}

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`config.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// API keys and subscriptions can only come from `config.toml`, as
/// `[[api_keys]]` and `[[subscriptions]]` tables.
///
/// # Example
///
/// ```no_run
/// use courier_api::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
/// println!("Server will bind to {}", config.server_addr);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Storage
    /// Storage backend, `memory` or `postgres`.
    ///
    /// Environment variable: `STORAGE_BACKEND`
    #[serde(default = "default_storage_backend", alias = "STORAGE_BACKEND")]
    pub storage_backend: StorageBackend,
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url", alias = "DATABASE_URL")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,
    /// Minimum number of connections to maintain in the pool.
    ///
    /// Environment variable: `DATABASE_MIN_CONNECTIONS`
    #[serde(default = "default_min_connections", alias = "DATABASE_MIN_CONNECTIONS")]
    pub database_min_connections: u32,
    /// Connection acquire timeout in seconds.
    ///
    /// Environment variable: `DATABASE_CONNECTION_TIMEOUT`
    #[serde(default = "default_acquire_timeout", alias = "DATABASE_CONNECTION_TIMEOUT")]
    pub database_connection_timeout: u64,

    // Server
    /// Socket address the API binds to.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[serde(default = "default_server_addr", alias = "SERVER_ADDR")]
    pub server_addr: String,
    /// HTTP request timeout in seconds.
    ///
    /// Environment variable: `REQUEST_TIMEOUT`
    #[serde(default = "default_request_timeout", alias = "REQUEST_TIMEOUT")]
    pub request_timeout: u64,

    // Delivery
    /// Number of concurrent delivery workers.
    ///
    /// Environment variable: `DELIVERY_WORKER_COUNT`
    #[serde(default = "default_worker_count", alias = "DELIVERY_WORKER_COUNT")]
    pub delivery_worker_count: usize,
    /// Tasks a worker claims per batch.
    ///
    /// Environment variable: `DELIVERY_BATCH_SIZE`
    #[serde(default = "default_batch_size", alias = "DELIVERY_BATCH_SIZE")]
    pub delivery_batch_size: usize,
    /// Idle poll interval for workers and the dispatcher, in milliseconds.
    ///
    /// Environment variable: `DELIVERY_POLL_INTERVAL_MS`
    #[serde(default = "default_poll_interval_ms", alias = "DELIVERY_POLL_INTERVAL_MS")]
    pub delivery_poll_interval_ms: u64,
    /// Upper bound on a webhook call, in seconds.
    ///
    /// Environment variable: `DELIVERY_TIMEOUT_SECONDS`
    #[serde(default = "default_delivery_timeout", alias = "DELIVERY_TIMEOUT_SECONDS")]
    pub delivery_timeout_seconds: u64,
    /// Lease on a claimed task, in seconds. Must exceed the delivery
    /// timeout so a live worker never loses its task mid-call.
    ///
    /// Environment variable: `TASK_VISIBILITY_TIMEOUT_SECONDS`
    #[serde(default = "default_task_visibility", alias = "TASK_VISIBILITY_TIMEOUT_SECONDS")]
    pub task_visibility_timeout_seconds: u64,
    /// Events the dispatcher claims per round.
    ///
    /// Environment variable: `DISPATCHER_BATCH_SIZE`
    #[serde(default = "default_dispatcher_batch_size", alias = "DISPATCHER_BATCH_SIZE")]
    pub dispatcher_batch_size: usize,
    /// Dispatcher claim on an event, in seconds.
    ///
    /// Environment variable: `DISPATCHER_LEASE_SECONDS`
    #[serde(default = "default_dispatcher_lease", alias = "DISPATCHER_LEASE_SECONDS")]
    pub dispatcher_lease_seconds: u64,
    /// Time allowed for workers to drain on shutdown, in seconds.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECONDS`
    #[serde(default = "default_shutdown_timeout", alias = "SHUTDOWN_TIMEOUT_SECONDS")]
    pub shutdown_timeout_seconds: u64,

    // Retry
    /// Attempts per delivery for seeded subscriptions.
    ///
    /// Environment variable: `RETRY_MAX_ATTEMPTS`
    #[serde(default = "default_retry_attempts", alias = "RETRY_MAX_ATTEMPTS")]
    pub retry_max_attempts: u32,
    /// First retry delay in milliseconds.
    ///
    /// Environment variable: `RETRY_INITIAL_DELAY_MS`
    #[serde(default = "default_initial_delay_ms", alias = "RETRY_INITIAL_DELAY_MS")]
    pub retry_initial_delay_ms: u64,
    /// Longest retry delay in milliseconds.
    ///
    /// Environment variable: `RETRY_MAX_DELAY_MS`
    #[serde(default = "default_max_delay_ms", alias = "RETRY_MAX_DELAY_MS")]
    pub retry_max_delay_ms: u64,
    /// Growth factor between retries.
    ///
    /// Environment variable: `RETRY_MULTIPLIER`
    #[serde(default = "default_multiplier", alias = "RETRY_MULTIPLIER")]
    pub retry_multiplier: f64,
    /// Delay curve, `exponential`, `linear` or `fixed`.
    ///
    /// Environment variable: `RETRY_STRATEGY`
    #[serde(default = "default_strategy", alias = "RETRY_STRATEGY")]
    pub retry_strategy: BackoffStrategy,
    /// Jitter factor for retry timing (0.0 to 1.0).
    ///
    /// Environment variable: `RETRY_JITTER_FACTOR`
    #[serde(default = "default_jitter_factor", alias = "RETRY_JITTER_FACTOR")]
    pub retry_jitter_factor: f64,

    // Ingestion
    /// Default requests per minute per credential.
    ///
    /// Environment variable: `RATE_LIMIT_REQUESTS_PER_MINUTE`
    #[serde(default = "default_rpm", alias = "RATE_LIMIT_REQUESTS_PER_MINUTE")]
    pub rate_limit_requests_per_minute: u32,
    /// Default bucket size; equals the per-minute rate when unset.
    ///
    /// Environment variable: `RATE_LIMIT_BURST`
    #[serde(default, alias = "RATE_LIMIT_BURST")]
    pub rate_limit_burst: Option<u32>,
    /// Largest event payload in bytes.
    ///
    /// Environment variable: `MAX_EVENT_BYTES`
    #[serde(default = "default_max_event_bytes", alias = "MAX_EVENT_BYTES")]
    pub max_event_bytes: usize,
    /// Most events per batch request.
    ///
    /// Environment variable: `MAX_BATCH_EVENTS`
    #[serde(default = "default_max_batch_events", alias = "MAX_BATCH_EVENTS")]
    pub max_batch_events: usize,
    /// Largest batch request body in bytes.
    ///
    /// Environment variable: `MAX_BATCH_BYTES`
    #[serde(default = "default_max_batch_bytes", alias = "MAX_BATCH_BYTES")]
    pub max_batch_bytes: usize,
    /// Idempotency key lifetime in seconds.
    ///
    /// Environment variable: `IDEMPOTENCY_TTL_SECONDS`
    #[serde(default = "default_idempotency_ttl", alias = "IDEMPOTENCY_TTL_SECONDS")]
    pub idempotency_ttl_seconds: u64,
    /// Interval between purges of expired idempotency keys and lapsed inbox
    /// leases, in seconds.
    ///
    /// Environment variable: `IDEMPOTENCY_SWEEP_INTERVAL_SECONDS`
    #[serde(default = "default_sweep_interval", alias = "IDEMPOTENCY_SWEEP_INTERVAL_SECONDS")]
    pub idempotency_sweep_interval_seconds: u64,

    // Inbox
    /// Visibility window when the poller sets none, in seconds.
    ///
    /// Environment variable: `INBOX_DEFAULT_VISIBILITY_SECONDS`
    #[serde(default = "default_inbox_visibility", alias = "INBOX_DEFAULT_VISIBILITY_SECONDS")]
    pub inbox_default_visibility_seconds: u64,
    /// Longest visibility window, in seconds.
    ///
    /// Environment variable: `INBOX_MAX_VISIBILITY_SECONDS`
    #[serde(default = "default_inbox_max_visibility", alias = "INBOX_MAX_VISIBILITY_SECONDS")]
    pub inbox_max_visibility_seconds: u64,
    /// Largest inbox page.
    ///
    /// Environment variable: `INBOX_MAX_BATCH`
    #[serde(default = "default_inbox_max_batch", alias = "INBOX_MAX_BATCH")]
    pub inbox_max_batch: usize,

    // Replay and streaming
    /// Whether replays are accepted.
    ///
    /// Environment variable: `ENABLE_REPLAY`
    #[serde(default = "default_enable_replay", alias = "ENABLE_REPLAY")]
    pub enable_replay: bool,
    /// Replays allowed per event.
    ///
    /// Environment variable: `MAX_REPLAYS`
    #[serde(default = "default_max_replays", alias = "MAX_REPLAYS")]
    pub max_replays: u32,
    /// Interval between stream heartbeats, in seconds.
    ///
    /// Environment variable: `STREAM_HEARTBEAT_SECONDS`
    #[serde(default = "default_heartbeat", alias = "STREAM_HEARTBEAT_SECONDS")]
    pub stream_heartbeat_seconds: u64,

    // Logging
    /// Log filter directives.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,

    // Bootstrap
    /// API keys written to the credential store at startup.
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
    /// Subscriptions written to the store at startup.
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
}

impl Config {
    /// Load configuration from defaults, `config.toml`, and environment
    /// variable overrides, then validate it.
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Serialized::defaults(Self::default()))
                .merge(Toml::file(CONFIG_FILE))
                .merge(Env::prefixed("")),
        )
    }

    /// Extracts and validates a configuration from `figment`.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Convert to the delivery engine's configuration.
    pub fn to_delivery_config(&self) -> DeliveryConfig {
        let poll_interval = Duration::from_millis(self.delivery_poll_interval_ms);
        DeliveryConfig {
            worker_count: self.delivery_worker_count,
            batch_size: self.delivery_batch_size,
            poll_interval,
            task_visibility_timeout: Duration::from_secs(self.task_visibility_timeout_seconds),
            client_config: self.to_client_config(),
            dispatcher: DispatcherConfig {
                batch_size: self.dispatcher_batch_size,
                lease: Duration::from_secs(self.dispatcher_lease_seconds),
                poll_interval,
            },
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
        }
    }

    /// Convert to HTTP client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.delivery_timeout_seconds),
            ..ClientConfig::default()
        }
    }

    /// Retry policy given to seeded subscriptions.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            initial_delay_ms: self.retry_initial_delay_ms,
            max_delay_ms: self.retry_max_delay_ms,
            multiplier: self.retry_multiplier,
            strategy: self.retry_strategy,
            jitter_factor: self.retry_jitter_factor,
        }
    }

    /// Tier for credentials without their own rate.
    pub fn to_rate_limit_tier(&self) -> RateLimitTier {
        let rpm = self.rate_limit_requests_per_minute;
        RateLimitTier {
            capacity: self.rate_limit_burst.unwrap_or(rpm),
            refill_per_second: f64::from(rpm) / 60.0,
        }
    }

    /// Ingestion limits.
    pub fn to_ingest_limits(&self) -> IngestLimits {
        IngestLimits {
            max_event_bytes: self.max_event_bytes,
            max_batch_events: self.max_batch_events,
            max_batch_bytes: self.max_batch_bytes,
            idempotency_ttl: Duration::from_secs(self.idempotency_ttl_seconds),
        }
    }

    /// Inbox visibility bounds.
    pub fn to_inbox_config(&self) -> InboxConfig {
        InboxConfig {
            default_visibility_secs: self.inbox_default_visibility_seconds,
            max_visibility_secs: self.inbox_max_visibility_seconds,
            max_batch: self.inbox_max_batch,
        }
    }

    /// Replay switch and cap.
    pub fn to_replay_config(&self) -> ReplayConfig {
        ReplayConfig { enabled: self.enable_replay, max_replays: self.max_replays }
    }

    /// Everything the HTTP layer needs.
    pub fn to_api_settings(&self) -> ApiSettings {
        ApiSettings {
            ingest: self.to_ingest_limits(),
            inbox: self.to_inbox_config(),
            replay: self.to_replay_config(),
            rate_limit: self.to_rate_limit_tier(),
            request_timeout: Duration::from_secs(self.request_timeout),
            stream_heartbeat: Duration::from_secs(self.stream_heartbeat_seconds),
        }
    }

    /// Parse the server socket address.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        SocketAddr::from_str(&self.server_addr).context("Invalid server address")
    }

    /// Get database URL with password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                let mut masked = self.database_url.clone();
                masked.replace_range(colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
        self.database_url.clone()
    }

    /// Writes the configured API keys and subscriptions.
    ///
    /// Existing subscriptions keep their status and health counters.
    pub async fn seed_storage(&self, storage: &Storage, now: DateTime<Utc>) -> Result<SeedReport> {
        for api_key in &self.api_keys {
            let credential = Credential {
                id: CredentialId::new(),
                account_id: api_key.account_id,
                name: api_key.name.clone(),
                key_hash: sha256::digest(api_key.key.as_bytes()),
                scopes: api_key.scopes.clone(),
                requests_per_minute: api_key.requests_per_minute,
                revoked_at: None,
                created_at: now,
            };
            storage
                .credentials
                .upsert(&credential)
                .await
                .with_context(|| format!("failed to seed API key {:?}", api_key.name))?;
        }

        for seed in &self.subscriptions {
            let existing = storage.subscriptions.find(seed.id).await?;
            let subscription = self.build_subscription(seed, existing, now);
            storage
                .subscriptions
                .upsert(&subscription)
                .await
                .with_context(|| format!("failed to seed subscription {}", seed.id))?;
        }

        let report =
            SeedReport { api_keys: self.api_keys.len(), subscriptions: self.subscriptions.len() };
        info!(api_keys = report.api_keys, subscriptions = report.subscriptions, "storage seeded");
        Ok(report)
    }

    fn build_subscription(
        &self,
        seed: &SubscriptionConfig,
        existing: Option<Subscription>,
        now: DateTime<Utc>,
    ) -> Subscription {
        let event_types =
            if seed.event_types.is_empty() { vec!["*".to_string()] } else { seed.event_types.clone() };
        let filter = EventFilter::for_types(event_types).with_sources(seed.sources.clone());

        let mut subscription =
            Subscription::new(seed.account_id, seed.url.clone(), seed.secret.clone(), filter, now);
        subscription.id = seed.id;
        subscription.name = seed.name.clone();
        subscription.retry_policy = self.to_retry_policy();
        if let Some(max_attempts) = seed.max_attempts {
            subscription.retry_policy.max_attempts = max_attempts;
        }
        if let Some(timeout) = seed.timeout_seconds {
            subscription.timeout_seconds = timeout;
        }
        if let Some(threshold) = seed.failure_threshold {
            subscription.failure_threshold = threshold;
        }
        subscription.custom_headers = seed.custom_headers.clone();

        if let Some(existing) = existing {
            subscription.status = existing.status;
            subscription.consecutive_failures = existing.consecutive_failures;
            subscription.last_success_at = existing.last_success_at;
            subscription.last_failure_at = existing.last_failure_at;
            subscription.last_failure_reason = existing.last_failure_reason;
            subscription.created_at = existing.created_at;
        } else {
            subscription.status = SubscriptionStatus::Active;
        }
        subscription
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.storage_backend == StorageBackend::Postgres && self.database_url.trim().is_empty() {
            anyhow::bail!("database_url is required for the postgres storage backend");
        }

        if self.database_max_connections == 0 {
            anyhow::bail!("database max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database min_connections cannot exceed max_connections");
        }

        self.parse_server_addr()?;

        if self.delivery_worker_count == 0 {
            anyhow::bail!("delivery_worker_count must be greater than 0");
        }

        if self.delivery_batch_size == 0 || self.dispatcher_batch_size == 0 {
            anyhow::bail!("delivery and dispatcher batch sizes must be greater than 0");
        }

        if self.delivery_poll_interval_ms == 0 {
            anyhow::bail!("delivery_poll_interval_ms must be greater than 0");
        }

        if self.task_visibility_timeout_seconds <= self.delivery_timeout_seconds {
            anyhow::bail!("task_visibility_timeout_seconds must exceed delivery_timeout_seconds");
        }

        if self.retry_max_attempts == 0 {
            anyhow::bail!("retry_max_attempts must be greater than 0");
        }

        if self.retry_initial_delay_ms > self.retry_max_delay_ms {
            anyhow::bail!("retry_initial_delay_ms cannot exceed retry_max_delay_ms");
        }

        if self.retry_multiplier < 1.0 {
            anyhow::bail!("retry_multiplier must be at least 1.0");
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            anyhow::bail!("retry_jitter_factor must be between 0.0 and 1.0");
        }

        if self.rate_limit_requests_per_minute == 0 || self.rate_limit_burst == Some(0) {
            anyhow::bail!("rate limit rate and burst must be greater than 0");
        }

        if self.max_event_bytes == 0 || self.max_batch_events == 0 || self.max_batch_bytes == 0 {
            anyhow::bail!("ingestion limits must be greater than 0");
        }

        if self.inbox_default_visibility_seconds == 0
            || self.inbox_default_visibility_seconds > self.inbox_max_visibility_seconds
        {
            anyhow::bail!(
                "inbox_default_visibility_seconds must be between 1 and inbox_max_visibility_seconds"
            );
        }

        if self.inbox_max_batch == 0 {
            anyhow::bail!("inbox_max_batch must be greater than 0");
        }

        if self.stream_heartbeat_seconds == 0 || self.idempotency_sweep_interval_seconds == 0 {
            anyhow::bail!("stream heartbeat and idempotency sweep intervals must be greater than 0");
        }

        for api_key in &self.api_keys {
            if api_key.key.trim().is_empty() {
                anyhow::bail!("api key {:?} has an empty key", api_key.name);
            }
            if api_key.scopes.is_empty() {
                anyhow::bail!("api key {:?} grants no scopes", api_key.name);
            }
        }

        for subscription in &self.subscriptions {
            if subscription.secret.is_empty() {
                anyhow::bail!("subscription {} has an empty signing secret", subscription.id);
            }
            if !subscription.url.starts_with("http://") && !subscription.url.starts_with("https://")
            {
                anyhow::bail!("subscription {} url must be http or https", subscription.id);
            }
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_backend: default_storage_backend(),
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            database_connection_timeout: default_acquire_timeout(),
            server_addr: default_server_addr(),
            request_timeout: default_request_timeout(),
            delivery_worker_count: default_worker_count(),
            delivery_batch_size: default_batch_size(),
            delivery_poll_interval_ms: default_poll_interval_ms(),
            delivery_timeout_seconds: default_delivery_timeout(),
            task_visibility_timeout_seconds: default_task_visibility(),
            dispatcher_batch_size: default_dispatcher_batch_size(),
            dispatcher_lease_seconds: default_dispatcher_lease(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            retry_max_attempts: default_retry_attempts(),
            retry_initial_delay_ms: default_initial_delay_ms(),
            retry_max_delay_ms: default_max_delay_ms(),
            retry_multiplier: default_multiplier(),
            retry_strategy: default_strategy(),
            retry_jitter_factor: default_jitter_factor(),
            rate_limit_requests_per_minute: default_rpm(),
            rate_limit_burst: None,
            max_event_bytes: default_max_event_bytes(),
            max_batch_events: default_max_batch_events(),
            max_batch_bytes: default_max_batch_bytes(),
            idempotency_ttl_seconds: default_idempotency_ttl(),
            idempotency_sweep_interval_seconds: default_sweep_interval(),
            inbox_default_visibility_seconds: default_inbox_visibility(),
            inbox_max_visibility_seconds: default_inbox_max_visibility(),
            inbox_max_batch: default_inbox_max_batch(),
            enable_replay: default_enable_replay(),
            max_replays: default_max_replays(),
            stream_heartbeat_seconds: default_heartbeat(),
            rust_log: default_log_level(),
            api_keys: Vec::new(),
            subscriptions: Vec::new(),
        }
    }
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::Postgres
}

fn default_database_url() -> String {
    "postgresql://localhost/courier".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_server_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_worker_count() -> usize {
    courier_delivery::DEFAULT_WORKER_COUNT
}

fn default_batch_size() -> usize {
    courier_delivery::DEFAULT_BATCH_SIZE
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_delivery_timeout() -> u64 {
    courier_delivery::DEFAULT_TIMEOUT_SECONDS
}

fn default_task_visibility() -> u64 {
    60
}

fn default_dispatcher_batch_size() -> usize {
    100
}

fn default_dispatcher_lease() -> u64 {
    30
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    6
}

fn default_initial_delay_ms() -> u64 {
    60_000
}

fn default_max_delay_ms() -> u64 {
    3_600_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_strategy() -> BackoffStrategy {
    BackoffStrategy::Exponential
}

fn default_jitter_factor() -> f64 {
    0.1
}

fn default_rpm() -> u32 {
    600
}

fn default_max_event_bytes() -> usize {
    256 * 1024
}

fn default_max_batch_events() -> usize {
    100
}

fn default_max_batch_bytes() -> usize {
    1024 * 1024
}

fn default_idempotency_ttl() -> u64 {
    24 * 60 * 60
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_inbox_visibility() -> u64 {
    30
}

fn default_inbox_max_visibility() -> u64 {
    12 * 60 * 60
}

fn default_inbox_max_batch() -> usize {
    100
}

fn default_enable_replay() -> bool {
    true
}

fn default_max_replays() -> u32 {
    3
}

fn default_heartbeat() -> u64 {
    15
}

fn default_log_level() -> String {
    "info,courier=debug,tower_http=debug".to_string()
}
