//! Repository layer for events, subscriptions, the delivery queue and the
//! auxiliary stores around them.
//!
//! Each submodule defines one repository trait together with its PostgreSQL
//! implementation; [`memory::MemoryStore`] implements every trait in-process
//! for tests and single-node development. The repositories act as an
//! anti-corruption layer: rows are decoded into private row structs and
//! converted into domain models, so schema details never leak upward.
//!
//! All state changes that other replicas must observe go through these
//! traits. Conditional writes (idempotency reservations, task leases and
//! the replay counter) are expressed as single statements or row-locked
//! transactions.

use std::sync::Arc;

use sqlx::PgPool;

pub mod attempts;
pub mod credentials;
pub mod dead_letters;
pub mod events;
pub mod idempotency;
pub mod inbox;
pub mod memory;
pub mod rate_limits;
pub mod subscriptions;
pub mod tasks;

pub use attempts::AttemptRepository;
pub use credentials::CredentialRepository;
pub use dead_letters::{DeadLetterRepository, DlqPage, DlqQuery, DlqStats};
pub use events::{EventCursor, EventQuery, EventRepository, OutcomeDelta};
pub use idempotency::{IdempotencyRepository, Reservation};
pub use inbox::InboxRepository;
pub use memory::MemoryStore;
pub use rate_limits::RateLimitRepository;
pub use subscriptions::SubscriptionRepository;
pub use tasks::TaskRepository;

use crate::error::{CoreError, Result};

#[derive(Clone)]
enum Backend {
    Memory(Arc<MemoryStore>),
    Postgres(PgPool),
}

/// Handles to every repository, sharing one backend.
#[derive(Clone)]
pub struct Storage {
    /// Accepted events and their delivery counters.
    pub events: Arc<dyn EventRepository>,

    /// Idempotency key reservations.
    pub idempotency: Arc<dyn IdempotencyRepository>,

    /// Webhook subscriptions and their health.
    pub subscriptions: Arc<dyn SubscriptionRepository>,

    /// The delivery queue.
    pub tasks: Arc<dyn TaskRepository>,

    /// Delivery attempt audit trail.
    pub attempts: Arc<dyn AttemptRepository>,

    /// Dead letter queue.
    pub dead_letters: Arc<dyn DeadLetterRepository>,

    /// Inbox visibility leases.
    pub inbox: Arc<dyn InboxRepository>,

    /// API credentials.
    pub credentials: Arc<dyn CredentialRepository>,

    /// Token buckets for the rate limiter.
    pub rate_limits: Arc<dyn RateLimitRepository>,

    backend: Backend,
}

impl Storage {
    /// Creates PostgreSQL-backed storage sharing one connection pool.
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            events: Arc::new(events::PgEventRepository::new(pool.clone())),
            idempotency: Arc::new(idempotency::PgIdempotencyRepository::new(pool.clone())),
            subscriptions: Arc::new(subscriptions::PgSubscriptionRepository::new(pool.clone())),
            tasks: Arc::new(tasks::PgTaskRepository::new(pool.clone())),
            attempts: Arc::new(attempts::PgAttemptRepository::new(pool.clone())),
            dead_letters: Arc::new(dead_letters::PgDeadLetterRepository::new(pool.clone())),
            inbox: Arc::new(inbox::PgInboxRepository::new(pool.clone())),
            credentials: Arc::new(credentials::PgCredentialRepository::new(pool.clone())),
            rate_limits: Arc::new(rate_limits::PgRateLimitRepository::new(pool.clone())),
            backend: Backend::Postgres(pool),
        }
    }

    /// Creates storage backed by a fresh in-process store.
    pub fn in_memory() -> Self {
        Self::from_memory(Arc::new(MemoryStore::new()))
    }

    /// Creates storage over an existing in-process store, so tests can keep
    /// a handle for fault injection.
    pub fn from_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            events: store.clone(),
            idempotency: store.clone(),
            subscriptions: store.clone(),
            tasks: store.clone(),
            attempts: store.clone(),
            dead_letters: store.clone(),
            inbox: store.clone(),
            credentials: store.clone(),
            rate_limits: store.clone(),
            backend: Backend::Memory(store),
        }
    }

    /// Returns the backend name for health reporting.
    pub fn backend_name(&self) -> &'static str {
        match self.backend {
            Backend::Memory(_) => "memory",
            Backend::Postgres(_) => "postgres",
        }
    }

    /// Applies pending schema migrations. A no-op for the in-memory backend.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        if let Backend::Postgres(pool) = &self.backend {
            sqlx::migrate!("./migrations")
                .run(pool)
                .await
                .map_err(|e| CoreError::Database(format!("migration failed: {e}")))?;
        }
        Ok(())
    }

    /// Verifies the backend is reachable.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the backend is unavailable.
    pub async fn health_check(&self) -> Result<()> {
        match &self.backend {
            Backend::Memory(store) => store.ping(),
            Backend::Postgres(pool) => {
                let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(pool).await?;
                Ok(())
            },
        }
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").field("backend", &self.backend_name()).finish_non_exhaustive()
    }
}

pub(crate) fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

pub(crate) fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

pub(crate) fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_storage_is_healthy() {
        let storage = Storage::in_memory();
        assert_eq!(storage.backend_name(), "memory");
        assert!(storage.health_check().await.is_ok());
        assert!(storage.migrate().await.is_ok());
    }

    #[tokio::test]
    async fn postgres_storage_can_be_constructed_lazily() {
        let pool = PgPool::connect_lazy("postgresql://localhost/courier").unwrap();
        let storage = Storage::postgres(pool);
        assert_eq!(storage.backend_name(), "postgres");
    }

    #[test]
    fn integer_conversions_saturate() {
        assert_eq!(to_i32(u32::MAX), i32::MAX);
        assert_eq!(to_u32(-5), 0);
        assert_eq!(to_u32(7), 7);
    }
}
