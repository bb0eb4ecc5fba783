use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::AppState;

/// POST /api/control/pause: Skip monitor ticks until resumed.
pub async fn pause(State(state): State<AppState>) -> impl IntoResponse {
    state.monitor.pause();
    tracing::warn!("Position monitor PAUSED via control API");
    (StatusCode::OK, Json(json!({ "status": "paused" })))
}

/// POST /api/control/resume: Resume monitor ticks.
pub async fn resume(State(state): State<AppState>) -> impl IntoResponse {
    state.monitor.resume();
    tracing::info!("Position monitor RESUMED via control API");
    (StatusCode::OK, Json(json!({ "status": "running" })))
}

/// GET /api/control/status: Monitor state and last tick summary.
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.monitor.status())
}
