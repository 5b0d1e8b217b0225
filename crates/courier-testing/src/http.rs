//! Mock webhook subscriber built on wiremock.

use std::time::Duration;

use wiremock::{
    matchers::{method, path},
    Mock, MockServer as WiremockServer, Request, ResponseTemplate,
};

/// Canned subscriber behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockResponse {
    /// `200 OK` with an empty body.
    Success,
    /// The given status with a short text body.
    Status(u16),
    /// `429` with a `Retry-After` in seconds.
    RateLimited {
        /// Value of the `Retry-After` header
        retry_after_secs: u64,
    },
    /// `200 OK` after a delay, for timeout tests.
    Delayed(Duration),
}

impl MockResponse {
    fn template(&self) -> ResponseTemplate {
        match self {
            Self::Success => ResponseTemplate::new(200),
            Self::Status(status) => {
                ResponseTemplate::new(*status).set_body_string(format!("mock status {status}"))
            },
            Self::RateLimited { retry_after_secs } => ResponseTemplate::new(429)
                .insert_header("Retry-After", retry_after_secs.to_string().as_str()),
            Self::Delayed(delay) => ResponseTemplate::new(200).set_delay(*delay),
        }
    }
}

/// HTTP server standing in for webhook subscribers.
pub struct MockServer {
    server: WiremockServer,
}

impl MockServer {
    /// Starts a server on a random local port.
    pub async fn start() -> Self {
        Self { server: WiremockServer::start().await }
    }

    /// Base URL of the server.
    pub fn url(&self) -> String {
        self.server.uri()
    }

    /// Full URL of `path`.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.server.uri())
    }

    /// Answers every POST to `path` with `response`.
    pub async fn respond(&self, path_str: &str, response: MockResponse) {
        Mock::given(method("POST"))
            .and(path(path_str))
            .respond_with(response.template())
            .mount(&self.server)
            .await;
    }

    /// Answers POSTs to `path` with `responses` in order; the last one
    /// repeats forever.
    pub async fn respond_sequence(&self, path_str: &str, responses: &[MockResponse]) {
        let Some((last, leading)) = responses.split_last() else {
            return;
        };
        for response in leading {
            Mock::given(method("POST"))
                .and(path(path_str))
                .respond_with(response.template())
                .up_to_n_times(1)
                .with_priority(1)
                .mount(&self.server)
                .await;
        }
        self.respond(path_str, last.clone()).await;
    }

    /// Requests received on `path`, in arrival order.
    pub async fn requests_to(&self, path_str: &str) -> Vec<Request> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|request| request.url.path() == path_str)
            .collect()
    }

    /// Drops every mounted response and recorded request.
    pub async fn reset(&self) {
        self.server.reset().await;
    }

    /// The underlying wiremock server.
    pub fn inner(&self) -> &WiremockServer {
        &self.server
    }
}
