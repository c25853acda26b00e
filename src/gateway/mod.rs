// ABOUTME: Gateway transport — WebSocket endpoint, health and metrics routes, graceful serve loop.
// ABOUTME: Connections upgrade at /ws and run the handshake state machine in connection.rs.

pub mod connection;
pub mod methods;

use crate::server::GatewayCore;
use anyhow::{Context, Result};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct GatewayState {
    pub core: Arc<GatewayCore>,
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_socket(socket, state.core))
}

async fn health_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    axum::Json(state.core.status())
}

async fn metrics_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    match state.metrics {
        Some(handle) => handle.render(),
        None => String::new(),
    }
}

/// Bind and serve until the shutdown token fires. Live connections get a
/// graceful close through axum's shutdown path.
pub async fn run(state: GatewayState, shutdown: CancellationToken) -> Result<()> {
    let config = state.core.config();
    let addr = format!("{}:{}", config.gateway.bind, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind gateway on {}", addr))?;
    tracing::info!(addr = %addr, "Gateway listening");

    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Gateway server failed")?;
    Ok(())
}
