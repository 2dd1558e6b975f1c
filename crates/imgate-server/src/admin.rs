//! Read-only admin HTTP surface: health and stats.

use std::net::SocketAddr;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{GatewayError, GatewayResult};
use crate::server::GatewayHandle;
use crate::stats::StatsSnapshot;

/// Service name reported by the health endpoint.
pub const SERVICE_NAME: &str = "imgate";

/// Status of one dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentHealth {
    /// `UP` or `DOWN`.
    pub status: &'static str,
    /// Failure detail when down.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Components probed by the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthComponents {
    /// Shared directory store.
    pub directory: ComponentHealth,
}

/// Body of `GET /gateway/health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    /// Service name.
    pub service: &'static str,
    /// `UP`, or `DRAINING` once shutdown has started.
    pub status: &'static str,
    /// Time of the probe.
    pub timestamp: DateTime<Utc>,
    /// Dependency status.
    pub components: HealthComponents,
}

/// Health check: process status and shared-store reachability.
///
/// An unreachable store is reported but does not fail the check; the
/// gateway keeps serving local sessions without it.
pub async fn health(State(handle): State<GatewayHandle>) -> (StatusCode, Json<HealthResponse>) {
    let directory = match handle.ping_directory().await {
        Ok(()) => ComponentHealth {
            status: "UP",
            message: None,
        },
        Err(err) => ComponentHealth {
            status: "DOWN",
            message: Some(err.to_string()),
        },
    };
    let (code, status) = if handle.is_shutting_down() {
        (StatusCode::SERVICE_UNAVAILABLE, "DRAINING")
    } else {
        (StatusCode::OK, "UP")
    };
    (
        code,
        Json(HealthResponse {
            service: SERVICE_NAME,
            status,
            timestamp: Utc::now(),
            components: HealthComponents { directory },
        }),
    )
}

/// Connection and directory counters.
pub async fn stats(State(handle): State<GatewayHandle>) -> Json<StatsSnapshot> {
    Json(handle.stats())
}

/// Create the admin router.
pub fn router(handle: GatewayHandle) -> Router {
    Router::new()
        .route("/gateway/health", get(health))
        .route("/gateway/stats", get(stats))
        .with_state(handle)
        .layer(TraceLayer::new_for_http())
}

/// Serve the admin router on `addr` until `shutdown` fires.
///
/// # Errors
///
/// Returns [`GatewayError::BindFailed`] if the address cannot be bound.
pub async fn serve(handle: GatewayHandle, addr: &str, shutdown: CancellationToken) -> GatewayResult<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::BindFailed(addr.to_string(), e))?;
    serve_on(handle, listener, shutdown).await
}

/// Serve the admin router on a bound listener until `shutdown` fires.
///
/// # Errors
///
/// Returns [`GatewayError::Transport`] if the HTTP server fails.
pub async fn serve_on(
    handle: GatewayHandle,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> GatewayResult<()> {
    let local: Option<SocketAddr> = listener.local_addr().ok();
    info!(addr = ?local, "admin endpoint listening");
    axum::serve(listener, router(handle))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| GatewayError::Transport(e.to_string()))
}
