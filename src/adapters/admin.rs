//! Admin / observability endpoint.
//!
//! * `GET /health` liveness plus counters summary
//! * `GET /stats` connection counters, client lists and the current timeout
//! * `PUT /connection-timeout` body `{"timeout_ms": 2500}`
//! * `GET /mappings` every HTTP mapping rule and the virtual host map
//! * `GET /services` the service list applied by the discovery poller
use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
};
use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use super::DiscoveryPoller;
use crate::{core::GatewayService, utils::ShutdownToken};

#[derive(Clone)]
struct AdminState {
    gateway: Arc<GatewayService>,
    discovery: Option<Arc<DiscoveryPoller>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectionTimeoutUpdate {
    pub timeout_ms: u64,
}

/// Build the admin router.
pub fn admin_router(
    gateway: Arc<GatewayService>,
    discovery: Option<Arc<DiscoveryPoller>>,
) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/connection-timeout", put(set_connection_timeout))
        .route("/mappings", get(mappings))
        .route("/services", get(services))
        .layer(TraceLayer::new_for_http())
        .with_state(AdminState { gateway, discovery })
}

/// Serve the admin router until shutdown.
pub async fn serve_admin(listener: TcpListener, router: Router, mut shutdown: ShutdownToken) -> Result<()> {
    let local_addr = listener
        .local_addr()
        .wrap_err("Failed to read admin listener address")?;
    tracing::info!(%local_addr, "Admin endpoint listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.wait_for_shutdown().await;
        })
        .await
        .wrap_err("Admin server error")
}

async fn health(State(state): State<AdminState>) -> impl IntoResponse {
    let tracker = state.gateway.tracker();
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "active_connections": tracker.active_connection_count(),
        "mapped_paths": state.gateway.mapped_path_count(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn stats(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.gateway.tracker().snapshot())
}

async fn set_connection_timeout(
    State(state): State<AdminState>,
    Json(update): Json<ConnectionTimeoutUpdate>,
) -> Response {
    if update.timeout_ms == 0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "timeout_ms must be greater than zero" })),
        )
            .into_response();
    }
    let tracker = state.gateway.tracker();
    tracker.set_connection_timeout(Duration::from_millis(update.timeout_ms));
    Json(tracker.snapshot()).into_response()
}

async fn mappings(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.gateway.mappings_snapshot())
}

async fn services(State(state): State<AdminState>) -> Response {
    match &state.discovery {
        Some(poller) => Json(poller.services().as_ref().clone()).into_response(),
        None => (StatusCode::NOT_FOUND, "Discovery is not running").into_response(),
    }
}
