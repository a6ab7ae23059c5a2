//! Rendezvous service: accepts one signaling WebSocket per session, registers the
//! session's virtual peers, pairs each new peer with a neighbor from another
//! session, and relays offer/answer/candidate frames by destination peer id.

use std::sync::Arc;

use axum::{extract::State, http::header, response::IntoResponse, routing::get, Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use serde_json::json;

pub mod config;
pub mod registry;
pub mod telemetry;
pub mod websocket;

use registry::{Registry, RegistryStats};

pub struct AppState {
    registry: Mutex<Registry>,
    metrics: PrometheusHandle,
}

impl AppState {
    pub fn new(metrics: PrometheusHandle) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Registry::new()),
            metrics,
        })
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.lock().stats()
    }

    fn render_metrics(&self) -> String {
        self.metrics.render()
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(websocket::websocket_handler))
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.stats())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.render_metrics();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}
