//! Courier event ingestion and webhook delivery service.
//!
//! Main entry point. Loads configuration, opens storage, starts the
//! delivery engine and the HTTP API, and coordinates graceful shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_api::{ApiSettings, AppState, Config, StorageBackend};
use courier_core::{Clock, RealClock, Storage};
use courier_delivery::DeliveryEngine;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log)?;

    info!(
        storage_backend = ?config.storage_backend,
        database_url = %config.database_url_masked(),
        server_addr = %config.server_addr,
        workers = config.delivery_worker_count,
        "starting courier"
    );

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let addr = config.parse_server_addr()?;

    let (storage, pool) = match config.storage_backend {
        StorageBackend::Memory => {
            warn!("using in-memory storage; state is lost on restart");
            (Storage::in_memory(), None)
        },
        StorageBackend::Postgres => {
            let pool = create_database_pool(&config).await?;
            (Storage::postgres(pool.clone()), Some(pool))
        },
    };
    storage.migrate().await.context("failed to run migrations")?;
    config.seed_storage(&storage, clock.now_utc()).await?;

    let mut engine = DeliveryEngine::new(storage.clone(), config.to_delivery_config(), clock.clone())
        .context("failed to create delivery engine")?;
    engine.start().await.context("failed to start delivery engine")?;

    let settings: ApiSettings = config.to_api_settings();
    let state = AppState::new(
        storage.clone(),
        clock.clone(),
        settings,
        engine.dispatch_wakeup(),
        engine.delivery_wakeup(),
    );

    let shutdown = CancellationToken::new();
    let sweeper = tokio::spawn(sweep_expired(
        storage.clone(),
        clock.clone(),
        Duration::from_secs(config.idempotency_sweep_interval_seconds),
        shutdown.clone(),
    ));

    let mut server = tokio::spawn(courier_api::start_server(
        state,
        addr,
        shutdown.clone().cancelled_owned(),
    ));
    info!(addr = %addr, "courier is ready to accept events");

    let exited_early = tokio::select! {
        () = courier_api::shutdown_signal() => None,
        result = &mut server => Some(result),
    };
    shutdown.cancel();

    let grace = Duration::from_secs(config.shutdown_timeout_seconds);
    let server_result = match exited_early {
        Some(result) => Ok(result),
        None => tokio::time::timeout(grace, server).await,
    };
    match server_result {
        Ok(Ok(Ok(()))) => info!("HTTP server stopped"),
        Ok(Ok(Err(e))) => error!(error = %e, "HTTP server failed"),
        Ok(Err(e)) => error!(error = %e, "HTTP server task panicked"),
        Err(_) => warn!("shutdown grace period expired with requests in flight"),
    }

    if let Err(e) = engine.shutdown().await {
        error!(error = %e, "delivery engine did not shut down cleanly");
    }
    if let Err(e) = sweeper.await {
        error!(error = %e, "expiry sweeper panicked");
    }

    if let Some(pool) = pool {
        pool.close().await;
        info!("database connections closed");
    }

    info!("courier shutdown complete");
    Ok(())
}

/// Initializes tracing; `RUST_LOG` in the environment wins over `default`.
fn init_tracing(default: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default))
        .context("invalid log filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("failed to verify database connection")?;
                info!("database connection pool established");
                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Purges expired idempotency keys and lapsed inbox leases until
/// `shutdown` is cancelled.
async fn sweep_expired(
    storage: Storage,
    clock: Arc<dyn Clock>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let now = clock.now_utc();
                match storage.idempotency.purge_expired(now).await {
                    Ok(0) => {},
                    Ok(purged) => debug!(purged, "expired idempotency keys purged"),
                    Err(e) => warn!(error = %e, "idempotency sweep failed"),
                }
                match storage.inbox.purge_expired(now).await {
                    Ok(0) => {},
                    Ok(purged) => debug!(purged, "lapsed inbox leases purged"),
                    Err(e) => warn!(error = %e, "inbox lease sweep failed"),
                }
            },
        }
    }
}
