//! HMAC-SHA256 webhook signatures.
//!
//! Every delivery carries `X-Timestamp` (unix seconds) and
//! `X-Signature: v1=<hex>`, where the hex digest is the HMAC-SHA256 of
//! `"{timestamp}.{body}"` keyed with the subscription's signing secret.
//! Binding the timestamp into the digest lets receivers reject replays of
//! old requests; [`verify_signature`] does both checks.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Prefix of the current signature scheme.
pub const SIGNATURE_VERSION: &str = "v1";

/// Header carrying the signature.
pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Header carrying the signing timestamp.
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";

/// Maximum age of a signature receivers should accept.
pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(300);

/// Signature generation and verification errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// The signing secret was rejected by the MAC.
    #[error("invalid signing secret")]
    InvalidSecret,

    /// The timestamp header is not a unix timestamp.
    #[error("malformed timestamp: {0}")]
    MalformedTimestamp(String),

    /// The signature header is not `v1=<hex>`.
    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    /// The timestamp is outside the tolerance window.
    #[error("signature timestamp outside tolerance")]
    Expired,

    /// The digest does not match the body.
    #[error("signature mismatch")]
    Mismatch,
}

fn mac_for(secret: &str, timestamp: i64, body: &[u8]) -> Result<HmacSha256, SignatureError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::InvalidSecret)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(mac)
}

/// Computes the `X-Signature` header value for `body` signed at `timestamp`.
///
/// # Errors
///
/// Returns `SignatureError::InvalidSecret` if the MAC rejects the secret.
pub fn sign(secret: &str, timestamp: i64, body: &[u8]) -> Result<String, SignatureError> {
    let digest = mac_for(secret, timestamp, body)?.finalize().into_bytes();
    Ok(format!("{SIGNATURE_VERSION}={}", hex::encode(digest)))
}

/// Verifies a delivery the way a receiver should.
///
/// `timestamp` and `signature` are the raw `X-Timestamp` and `X-Signature`
/// header values. The digest comparison runs in constant time.
///
/// # Errors
///
/// Returns the first check that failed.
pub fn verify_signature(
    secret: &str,
    timestamp: &str,
    body: &[u8],
    signature: &str,
    now: DateTime<Utc>,
    tolerance: Duration,
) -> Result<(), SignatureError> {
    let signed_at: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| SignatureError::MalformedTimestamp(timestamp.to_string()))?;

    let age = now.timestamp().abs_diff(signed_at);
    if age > tolerance.as_secs() {
        return Err(SignatureError::Expired);
    }

    let hex_digest = signature
        .trim()
        .strip_prefix(SIGNATURE_VERSION)
        .and_then(|rest| rest.strip_prefix('='))
        .ok_or_else(|| SignatureError::MalformedSignature(signature.to_string()))?;
    let expected =
        hex::decode(hex_digest).map_err(|e| SignatureError::MalformedSignature(e.to_string()))?;

    mac_for(secret, signed_at, body)?.verify_slice(&expected).map_err(|_| SignatureError::Mismatch)
}
