//! API key authentication.
//!
//! Keys arrive as `Authorization: Bearer <key>`, are hashed with SHA-256
//! and looked up by digest. The matching [`Credential`] is stored in the
//! request extensions; handlers check scopes with [`require_scope`].

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use courier_core::{CoreError, Credential, Scope, Storage};
use tracing::debug;

use crate::{error::ApiError, state::AppState};

/// Extracts the API key from a `Bearer` authorization header.
fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|key| !key.is_empty())
}

/// Resolves an API key to its credential.
async fn validate_api_key(storage: &Storage, api_key: &str) -> Result<Credential, AuthError> {
    let key_hash = sha256::digest(api_key.as_bytes());

    let credential =
        storage.credentials.find_by_key_hash(&key_hash).await?.ok_or(AuthError::InvalidApiKey)?;
    if credential.revoked_at.is_some() {
        return Err(AuthError::Revoked);
    }
    Ok(credential)
}

/// Errors that can occur during API key authentication.
#[derive(Debug)]
pub enum AuthError {
    /// The Authorization header is missing or not a bearer token.
    MissingHeader,
    /// No credential has this key.
    InvalidApiKey,
    /// The credential was revoked.
    Revoked,
    /// Credential lookup failed.
    Storage(CoreError),
}

impl From<CoreError> for AuthError {
    fn from(err: CoreError) -> Self {
        Self::Storage(err)
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingHeader => Self::Unauthorized("missing bearer token".to_string()),
            AuthError::InvalidApiKey => Self::Unauthorized("invalid API key".to_string()),
            AuthError::Revoked => Self::Unauthorized("API key has been revoked".to_string()),
            AuthError::Storage(err) => err.into(),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}

/// Axum middleware that authenticates requests using API keys.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let api_key = extract_api_key(req.headers()).ok_or(AuthError::MissingHeader)?;
    let credential = validate_api_key(&state.storage, api_key).await?;

    debug!(credential_id = %credential.id, account_id = %credential.account_id, "authenticated");
    req.extensions_mut().insert(credential);

    Ok(next.run(req).await)
}

/// Fails with `403` unless `credential` grants `scope`.
pub fn require_scope(credential: &Credential, scope: Scope) -> Result<(), ApiError> {
    if credential.has_scope(scope) {
        Ok(())
    } else {
        Err(ApiError::Forbidden(scope.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use chrono::Utc;
    use courier_core::{AccountId, CredentialId};

    use super::*;

    fn credential(key: &str, scopes: Vec<Scope>) -> Credential {
        Credential {
            id: CredentialId::new(),
            account_id: AccountId::new(),
            name: "test".to_string(),
            key_hash: sha256::digest(key),
            scopes,
            requests_per_minute: None,
            revoked_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn extract_api_key_from_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer ck_live_12345"));

        assert_eq!(extract_api_key(&headers), Some("ck_live_12345"));
    }

    #[test]
    fn extract_api_key_rejects_other_schemes() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_api_key(&headers), None);

        headers.insert("authorization", HeaderValue::from_static("Basic dXNlcjpwYXNz"));
        assert_eq!(extract_api_key(&headers), None);

        headers.insert("authorization", HeaderValue::from_static("Bearer "));
        assert_eq!(extract_api_key(&headers), None);
    }

    #[tokio::test]
    async fn keys_resolve_by_digest() {
        let storage = Storage::in_memory();
        let stored = credential("ck_secret", vec![Scope::EventsWrite]);
        storage.credentials.upsert(&stored).await.unwrap();

        let found = validate_api_key(&storage, "ck_secret").await.unwrap();
        assert_eq!(found.id, stored.id);

        let err = validate_api_key(&storage, "ck_other").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidApiKey));
    }

    #[tokio::test]
    async fn revoked_keys_are_rejected() {
        let storage = Storage::in_memory();
        let mut revoked = credential("ck_old", vec![Scope::EventsWrite]);
        revoked.revoked_at = Some(Utc::now());
        storage.credentials.upsert(&revoked).await.unwrap();

        let err = validate_api_key(&storage, "ck_old").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidApiKey | AuthError::Revoked));
    }

    #[test]
    fn missing_scope_is_forbidden() {
        let reader = credential("k", vec![Scope::EventsRead]);

        assert!(require_scope(&reader, Scope::EventsRead).is_ok());
        let err = require_scope(&reader, Scope::DlqManage).unwrap_err();
        assert_eq!(err.code(), "forbidden");
        assert_eq!(err.to_string(), "API key lacks the dlq:manage scope");
    }
}
