#![forbid(unsafe_code)]

// HTTP surface: the signaling WebSocket plus health and metrics endpoints

pub mod connection;
pub mod protocol;

use crate::metrics::ServerMetrics;
use crate::session::SessionRegistry;
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Largest inbound WebSocket message accepted
const MAX_MESSAGE_SIZE: usize = 65_536;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone)]
pub struct SignalingServer {
    registry: Arc<SessionRegistry>,
    metrics: ServerMetrics,
    /// One permit per open socket
    connections: Arc<Semaphore>,
    metrics_token: Option<Arc<str>>,
}

#[derive(Debug, Deserialize)]
struct JoinParams {
    /// Session to join; a fresh one is created when absent
    session: Option<String>,
}

impl SignalingServer {
    pub fn new(registry: Arc<SessionRegistry>, metrics: ServerMetrics, max_connections: usize) -> Self {
        info!("Accepting up to {} signaling connections", max_connections);
        Self {
            registry,
            metrics,
            connections: Arc::new(Semaphore::new(max_connections)),
            metrics_token: None,
        }
    }

    /// Requires `Authorization: Bearer <token>` on `/metrics`
    pub fn with_metrics_token(mut self, token: Option<String>) -> Self {
        self.metrics_token = token.map(Arc::from);
        self
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(join_session))
            .route("/health", get(health))
            .route("/metrics", get(metrics))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Binds `0.0.0.0:port` and serves until the listener fails
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling server on {}", addr);
        let listener = TcpListener::bind(&addr).await?;
        self.serve_with_listener(listener).await
    }

    pub async fn serve_with_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    fn metrics_authorized(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.metrics_token else {
            return true;
        };
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == &**expected)
    }
}

async fn health(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let worker_alive = server.registry.media_server().worker_manager().is_alive();
    Json(serde_json::json!({
        "status": if worker_alive { "ok" } else { "degraded" },
        "sessions": server.registry.session_count(),
        "peers": server.registry.peer_count(),
        "workerAlive": worker_alive,
    }))
}

async fn metrics(State(server): State<SignalingServer>, headers: HeaderMap) -> Response {
    if !server.metrics_authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let gauges = server.registry.media_gauges().await;
    let body = server.metrics.render_prometheus(&gauges);
    (StatusCode::OK, [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], body).into_response()
}

async fn join_session(
    ws: WebSocketUpgrade,
    Query(params): Query<JoinParams>,
    State(server): State<SignalingServer>,
) -> Response {
    let Ok(permit) = server.connections.clone().try_acquire_owned() else {
        warn!("Connection limit reached, rejecting WebSocket upgrade");
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    };

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_failed_upgrade(|error| warn!("WebSocket upgrade failed: {}", error))
        .on_upgrade(move |socket| {
            connection::handle_connection(socket, server.registry, params.session, server.metrics, permit)
        })
}
