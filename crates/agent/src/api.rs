//! HTTP telemetry emitter
//!
//! Exposes the agent's own health, status report, and Prometheus
//! self-metrics. The /status route is optionally protected with basic auth.

use crate::config::EmitterSection;
use agent_lib::{
    health::{ComponentStatus, HealthRegistry},
    observability::AgentMetrics,
    status::{StatusRegistry, StatusSnapshot},
};
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use base64::Engine;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: AgentMetrics,
    pub status: StatusRegistry,
    /// username/password required on /status, when configured
    pub status_credentials: Option<(String, String)>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        metrics: AgentMetrics,
        status: StatusRegistry,
        status_credentials: Option<(String, String)>,
    ) -> Self {
        Self {
            health_registry,
            metrics,
            status,
            status_credentials,
        }
    }
}

/// Body served by /status
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub version: String,
    #[serde(flatten)]
    pub snapshot: StatusSnapshot,
}

/// Health check response - returns 200 while operational, 503 once any
/// component has failed
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Current endpoint states and the recent lifecycle log
async fn status(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if !authorized(&headers, &state.status_credentials) {
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"metrics-agent\"")],
            Json(serde_json::json!({"error": "unauthorized"})),
        )
            .into_response();
    }

    let snapshot = state.status.snapshot().await;
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        snapshot,
    })
    .into_response()
}

/// Prometheus self-metrics endpoint
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            e.to_string().into_bytes(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

fn authorized(headers: &HeaderMap, expected: &Option<(String, String)>) -> bool {
    let Some((username, password)) = expected else {
        return true;
    };
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    decoded == format!("{username}:{password}").into_bytes()
}

/// Create the emitter router; disabled routes are simply absent
pub fn create_router(state: Arc<AppState>, settings: &EmitterSection) -> Router {
    let mut router = Router::new();
    if settings.health_enabled {
        router = router.route("/health", get(health));
    }
    if settings.status_enabled {
        router = router.route("/status", get(status));
    }
    if settings.metrics_enabled {
        router = router.route("/metrics", get(metrics));
    }
    router.with_state(state)
}

/// Start the emitter server
pub async fn serve(settings: EmitterSection, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state, &settings);

    info!(addr = %settings.address, "Starting telemetry emitter");

    let listener = tokio::net::TcpListener::bind(&settings.address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
