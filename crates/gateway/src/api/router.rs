//! HTTP router: the control-channel upgrade, the media offer endpoint, and
//! the observability endpoints.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::{offer, ws};
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/messages", get(ws::control_ws))
        .route("/api/offer", post(offer::handle_offer))
        .route("/api/health", get(health))
        .route("/api/metrics/connections", get(connection_metrics))
        .route("/api/metrics/bus", get(bus_metrics))
        .route("/api/metrics/sessions", get(session_metrics))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn connection_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let connections = state.connections.metrics();
    let mut by_state: std::collections::HashMap<&'static str, usize> =
        std::collections::HashMap::new();
    for info in &connections {
        *by_state.entry(info.state.as_str()).or_default() += 1;
    }
    Json(serde_json::json!({
        "total_connections": connections.len(),
        "connections_by_state": by_state,
        "connections": connections,
        "media_channels": state.media.len(),
    }))
}

async fn bus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.bus.stats())
}

async fn session_metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.sessions.stats())
}
