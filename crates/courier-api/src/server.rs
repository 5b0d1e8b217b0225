//! HTTP server configuration and request routing.
//!
//! Requests flow through middleware in order:
//! 1. Request ID propagation (`X-Request-Id`)
//! 2. Request/response tracing
//! 3. Timeout enforcement
//! 4. Body size limit
//! 5. API key authentication (all routes except `/health*`)
//! 6. Handler execution, which checks the route's scope
//!
//! # Graceful Shutdown
//!
//! [`start_server`] stops accepting connections once its shutdown future
//! resolves and waits for in-flight requests. [`shutdown_signal`] resolves on
//! CTRL+C or SIGTERM.

use std::{future::Future, net::SocketAddr};

use axum::{
    extract::{DefaultBodyLimit, Request},
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
    Router,
};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{handlers, middleware::auth_middleware, state::AppState};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Creates the router with all routes and middleware.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use courier_api::{create_router, ApiSettings, AppState};
/// use courier_core::{RealClock, Storage};
/// use courier_delivery::Wakeup;
///
/// let state = AppState::new(
///     Storage::in_memory(),
///     Arc::new(RealClock::new()),
///     ApiSettings::default(),
///     Wakeup::new(),
///     Wakeup::new(),
/// );
/// let app = create_router(state);
/// ```
pub fn create_router(state: AppState) -> Router {
    let settings = state.settings;
    // The handlers enforce the exact limits and answer with JSON errors;
    // this only stops unbounded reads.
    let body_limit = settings.ingest.max_batch_bytes.max(settings.ingest.max_request_bytes()) * 2;

    let health_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/health/live", get(handlers::liveness_check))
        .route("/health/ready", get(handlers::readiness_check));

    let api_routes = Router::new()
        .route("/events", post(handlers::create_event).get(handlers::list_events))
        .route("/events/batch", post(handlers::create_batch))
        .route("/events/stream", get(handlers::stream_events))
        .route("/events/{event_id}", get(handlers::get_event))
        .route("/events/{event_id}/replay", post(handlers::replay_event))
        .route("/inbox", get(handlers::poll_inbox))
        .route("/inbox/ack", post(handlers::acknowledge))
        .route("/inbox/visibility", post(handlers::change_visibility))
        .route("/dlq", get(handlers::list_dlq))
        .route("/dlq/stats", get(handlers::dlq_stats))
        .route("/dlq/{event_id}", delete(handlers::dismiss_dlq))
        .route("/dlq/{event_id}/retry", post(handlers::retry_dlq))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(DefaultBodyLimit::max(body_limit));

    Router::new()
        .merge(health_routes)
        .merge(api_routes)
        .layer(TimeoutLayer::new(settings.request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(propagate_request_id))
        .with_state(state)
}

/// Echoes the caller's `X-Request-Id`, or assigns one, on every response.
async fn propagate_request_id(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .filter(|value| !value.is_empty())
        .cloned()
        .or_else(|| HeaderValue::from_str(&Uuid::new_v4().to_string()).ok());

    if let Some(id) = &request_id {
        req.headers_mut().insert(REQUEST_ID_HEADER, id.clone());
    }

    let mut response = next.run(req).await;
    if let Some(id) = request_id {
        response.headers_mut().insert(REQUEST_ID_HEADER, id);
    }
    response
}

/// Serves `state` on `addr` until `shutdown` resolves.
///
/// # Errors
///
/// Returns `std::io::Error` if the address cannot be bound.
pub async fn start_server<F>(state: AppState, addr: SocketAddr, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP server listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

    info!("HTTP server stopped");
    Ok(())
}

/// Waits for a shutdown signal (CTRL+C or SIGTERM).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install CTRL+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received CTRL+C, starting graceful shutdown");
        },
        () = terminate => {
            info!("received SIGTERM, starting graceful shutdown");
        },
    }

    warn!("draining in-flight requests");
}
