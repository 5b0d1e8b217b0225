//! HTTP client for signed webhook delivery.
//!
//! Builds the signed POST for one (event, subscription) attempt, enforces
//! the subscription's timeout, and turns every non-2xx answer into a
//! categorized [`DeliveryError`] carrying the status and a truncated body
//! for the attempt record.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use courier_core::{AttemptId, Clock, Event, EventId, Subscription, SubscriptionId};
use reqwest::{header::HeaderMap, Response};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::{
    error::{DeliveryError, Result},
    signing::{sign, SIGNATURE_HEADER, TIMESTAMP_HEADER},
};

/// Response bodies are stored truncated to this many characters.
pub const MAX_RESPONSE_BODY_CHARS: usize = 10_000;

/// Configuration for the webhook delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Upper bound for any request; subscriptions pick shorter timeouts.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: format!("courier/{}", env!("CARGO_PKG_VERSION")),
            max_redirects: 3,
        }
    }
}

/// One signed delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Attempt being made.
    pub attempt_id: AttemptId,
    /// Event being delivered.
    pub event_id: EventId,
    /// Destination subscription.
    pub subscription_id: SubscriptionId,
    /// Destination URL.
    pub url: String,
    /// Serialized event payload.
    pub body: Bytes,
    /// Key for the HMAC signature.
    pub signing_secret: String,
    /// Subscription-defined extra headers.
    pub custom_headers: BTreeMap<String, String>,
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// Request timeout.
    pub timeout: Duration,
}

impl DeliveryRequest {
    /// Builds the request delivering `event` to `subscription`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Internal` if the payload cannot be serialized.
    pub fn new(event: &Event, subscription: &Subscription, attempt_number: u32) -> Result<Self> {
        let body = serde_json::to_vec(&event.payload())
            .map_err(|e| DeliveryError::internal(format!("failed to serialize payload: {e}")))?;

        Ok(Self {
            attempt_id: AttemptId::new(),
            event_id: event.id,
            subscription_id: subscription.id,
            url: subscription.url.clone(),
            body: Bytes::from(body),
            signing_secret: subscription.signing_secret.clone(),
            custom_headers: subscription.custom_headers.clone(),
            attempt_number,
            timeout: subscription.timeout(),
        })
    }
}

/// 2xx answer to a delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Response body, truncated.
    pub body: String,
    /// Total duration of the request.
    pub duration: Duration,
}

/// HTTP client shared by all delivery workers.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
    clock: Arc<dyn Clock>,
}

impl DeliveryClient {
    /// Creates a new delivery client.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built from `config`.
    pub fn new(config: ClientConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config, clock })
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Sends one signed delivery attempt.
    ///
    /// # Errors
    ///
    /// - `Network` for connection failures
    /// - `Timeout` when no response arrived within the request timeout
    /// - `ClientError`, `ServerError` or `RateLimited` for non-2xx answers
    /// - `Configuration` when the URL or a custom header is invalid
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let start_time = std::time::Instant::now();

        let span = info_span!(
            "webhook_delivery",
            event_id = %request.event_id,
            subscription_id = %request.subscription_id,
            attempt_id = %request.attempt_id,
            url = %request.url,
            attempt = request.attempt_number
        );

        async move {
            tracing::debug!("starting webhook delivery");

            let now = self.clock.now_utc();
            let timestamp = now.timestamp();
            let signature = sign(&request.signing_secret, timestamp, &request.body)
                .map_err(|e| DeliveryError::configuration(e.to_string()))?;

            let mut http_request = self.client.post(&request.url).timeout(request.timeout);

            for (key, value) in &request.custom_headers {
                if !is_managed_header(key) {
                    http_request = http_request.header(key.as_str(), value.as_str());
                }
            }

            http_request = http_request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header(TIMESTAMP_HEADER, timestamp.to_string())
                .header(SIGNATURE_HEADER, signature)
                .header("X-Event-Id", request.event_id.to_string())
                .header("X-Subscription-Id", request.subscription_id.to_string())
                .header("X-Delivery-Attempt", request.attempt_number.to_string())
                .body(request.body.clone());

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    tracing::warn!(duration_ms = duration.as_millis(), error = %e, "request failed");

                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(request.timeout.as_secs()));
                    }
                    if e.is_builder() {
                        return Err(DeliveryError::configuration(e.to_string()));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let status_code = response.status().as_u16();
            let is_success = response.status().is_success();
            let retry_after = extract_retry_after_seconds(response.headers(), now);
            let headers = extract_headers(response.headers());
            let body = read_body(response).await;
            let duration = start_time.elapsed();

            tracing::debug!(
                status = status_code,
                duration_ms = duration.as_millis(),
                "received response"
            );

            if is_success {
                Ok(DeliveryResponse { status_code, headers, body, duration })
            } else {
                tracing::warn!(status = status_code, "subscriber returned non-2xx");
                Err(DeliveryError::from_status(status_code, body, retry_after))
            }
        }
        .instrument(span)
        .await
    }
}

async fn read_body(response: Response) -> String {
    match response.bytes().await {
        Ok(bytes) => truncate_chars(&String::from_utf8_lossy(&bytes), MAX_RESPONSE_BODY_CHARS),
        Err(e) => {
            tracing::warn!(error = %e, "failed to read response body");
            format!("[failed to read response body: {e}]")
        },
    }
}

/// Truncates `text` to at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => text[..byte_index].to_string(),
        None => text.to_string(),
    }
}

fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    header_map
        .iter()
        .filter_map(|(key, value)| value.to_str().ok().map(|v| (key.to_string(), v.to_string())))
        .collect()
}

/// Headers the client sets itself; subscriptions cannot override them.
fn is_managed_header(header_name: &str) -> bool {
    let lowercase = header_name.to_ascii_lowercase();
    matches!(
        lowercase.as_str(),
        "content-length"
            | "content-type"
            | "host"
            | "user-agent"
            | "connection"
            | "keep-alive"
            | "transfer-encoding"
            | "upgrade"
            | "x-timestamp"
            | "x-signature"
            | "x-event-id"
            | "x-subscription-id"
            | "x-delivery-attempt"
    )
}

/// Parses `Retry-After` as delay seconds or an HTTP date.
///
/// Returns `None` when the header is absent or unparsable.
pub fn extract_retry_after_seconds(headers: &HeaderMap, now: DateTime<Utc>) -> Option<u64> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }

    let retry_at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some(u64::try_from((retry_at - now).num_seconds()).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use courier_core::{EventFilter, EventMetadata, RealClock};
    use reqwest::header::HeaderValue;
    use serde_json::json;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::signing::{verify_signature, DEFAULT_TOLERANCE};

    fn client() -> DeliveryClient {
        DeliveryClient::new(ClientConfig::default(), Arc::new(RealClock::new())).unwrap()
    }

    fn request(url: String) -> DeliveryRequest {
        let event = Event::new(
            courier_core::AccountId::new(),
            "order.created",
            "shop",
            json!({ "order_id": 42 }),
            EventMetadata::default(),
            Utc::now(),
        );
        let mut subscription =
            Subscription::new(event.account_id, url, "whsec_test", EventFilter::default(), Utc::now());
        subscription.custom_headers.insert("X-Tenant".into(), "acme".into());
        subscription.custom_headers.insert("X-Signature".into(), "forged".into());
        DeliveryRequest::new(&event, &subscription, 1).unwrap()
    }

    #[tokio::test]
    async fn successful_delivery_is_signed() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::header("content-type", "application/json"))
            .and(matchers::header("x-delivery-attempt", "1"))
            .and(matchers::header("x-tenant", "acme"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let request = request(server.uri());
        let event_id = request.event_id.to_string();
        let response = client().deliver(request).await.unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, "ok");

        let received = server.received_requests().await.unwrap();
        let delivered = &received[0];
        let header = |name: &str| delivered.headers.get(name).unwrap().to_str().unwrap().to_string();

        assert_eq!(header("x-event-id"), event_id);
        assert!(header("user-agent").starts_with("courier/"));
        let payload: serde_json::Value = serde_json::from_slice(&delivered.body).unwrap();
        assert_eq!(payload["type"], "order.created");
        assert_eq!(payload["data"]["order_id"], 42);

        verify_signature(
            "whsec_test",
            &header("x-timestamp"),
            &delivered.body,
            &header("x-signature"),
            Utc::now(),
            DEFAULT_TOLERANCE,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn server_error_carries_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let err = client().deliver(request(server.uri())).await.unwrap_err();
        assert_eq!(err.status_code(), Some(503));
        assert_eq!(err.response_body(), Some("maintenance"));
    }

    #[tokio::test]
    async fn rate_limit_exposes_retry_after() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "120"))
            .mount(&server)
            .await;

        let err = client().deliver(request(server.uri())).await.unwrap_err();
        assert_eq!(err.retry_after_seconds(), Some(120));
    }

    #[tokio::test]
    async fn slow_subscriber_times_out() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let mut request = request(server.uri());
        request.timeout = Duration::from_millis(100);
        let err = client().deliver(request).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Timeout { .. }));
    }

    #[tokio::test]
    async fn unreachable_subscriber_is_a_network_error() {
        let err = client().deliver(request("http://127.0.0.1:1/hook".into())).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Network { .. }));
    }

    #[tokio::test]
    async fn long_bodies_are_truncated() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("x".repeat(20_000)))
            .mount(&server)
            .await;

        let err = client().deliver(request(server.uri())).await.unwrap_err();
        assert_eq!(err.response_body().unwrap().chars().count(), MAX_RESPONSE_BODY_CHARS);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn retry_after_parsing() {
        let now = DateTime::parse_from_rfc2822("Wed, 21 Oct 2026 07:28:00 GMT")
            .unwrap()
            .with_timezone(&Utc);
        let mut headers = HeaderMap::new();
        assert_eq!(extract_retry_after_seconds(&headers, now), None);

        headers.insert("retry-after", HeaderValue::from_static("30"));
        assert_eq!(extract_retry_after_seconds(&headers, now), Some(30));

        headers.insert("retry-after", HeaderValue::from_static("Wed, 21 Oct 2026 07:29:00 GMT"));
        assert_eq!(extract_retry_after_seconds(&headers, now), Some(60));

        headers.insert("retry-after", HeaderValue::from_static("soon"));
        assert_eq!(extract_retry_after_seconds(&headers, now), None);
    }

    #[test]
    fn managed_headers_identified() {
        assert!(is_managed_header("X-Signature"));
        assert!(is_managed_header("content-type"));
        assert!(!is_managed_header("X-Tenant"));
    }
}
