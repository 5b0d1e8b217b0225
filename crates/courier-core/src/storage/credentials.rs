//! API credentials, looked up by key digest.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::to_u32;
use crate::{
    error::{CoreError, Result},
    models::{AccountId, Credential, CredentialId, Scope},
};

/// Persistence for credentials.
#[async_trait]
pub trait CredentialRepository: Send + Sync {
    /// Inserts or replaces a credential.
    async fn upsert(&self, credential: &Credential) -> Result<()>;

    /// Finds the unrevoked credential whose key hashes to `key_hash`.
    async fn find_by_key_hash(&self, key_hash: &str) -> Result<Option<Credential>>;
}

#[derive(sqlx::FromRow)]
struct CredentialRow {
    id: Uuid,
    account_id: Uuid,
    name: String,
    key_hash: String,
    scopes: Vec<String>,
    requests_per_minute: Option<i32>,
    revoked_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<CredentialRow> for Credential {
    type Error = CoreError;

    fn try_from(row: CredentialRow) -> Result<Self> {
        let scopes = row.scopes.iter().map(|s| s.parse::<Scope>()).collect::<Result<Vec<_>>>()?;
        Ok(Self {
            id: CredentialId(row.id),
            account_id: AccountId(row.account_id),
            name: row.name,
            key_hash: row.key_hash,
            scopes,
            requests_per_minute: row.requests_per_minute.map(to_u32),
            revoked_at: row.revoked_at,
            created_at: row.created_at,
        })
    }
}

/// PostgreSQL credential repository.
pub struct PgCredentialRepository {
    pool: PgPool,
}

impl PgCredentialRepository {
    /// Creates a repository over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialRepository for PgCredentialRepository {
    async fn upsert(&self, credential: &Credential) -> Result<()> {
        let scopes: Vec<&str> = credential.scopes.iter().map(Scope::as_str).collect();

        sqlx::query(
            r"
            INSERT INTO credentials (
                id, account_id, name, key_hash, scopes, requests_per_minute, revoked_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (key_hash) DO UPDATE SET
                name = EXCLUDED.name,
                scopes = EXCLUDED.scopes,
                requests_per_minute = EXCLUDED.requests_per_minute,
                revoked_at = EXCLUDED.revoked_at
            ",
        )
        .bind(credential.id.0)
        .bind(credential.account_id.0)
        .bind(&credential.name)
        .bind(&credential.key_hash)
        .bind(scopes)
        .bind(credential.requests_per_minute.map(|rpm| i32::try_from(rpm).unwrap_or(i32::MAX)))
        .bind(credential.revoked_at)
        .bind(credential.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_key_hash(&self, key_hash: &str) -> Result<Option<Credential>> {
        let row: Option<CredentialRow> = sqlx::query_as(
            r"
            SELECT id, account_id, name, key_hash, scopes, requests_per_minute, revoked_at,
                   created_at
            FROM credentials
            WHERE key_hash = $1 AND revoked_at IS NULL
            ",
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Credential::try_from).transpose()
    }
}
