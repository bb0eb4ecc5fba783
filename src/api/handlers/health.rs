use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::AppState;

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let monitor = state.monitor.state();

    let Some(db) = &state.db else {
        return (
            StatusCode::OK,
            Json(json!({ "status": "healthy", "monitor": monitor })),
        );
    };

    let db_ok = sqlx::query("SELECT 1").execute(db).await.is_ok();

    if db_ok {
        (
            StatusCode::OK,
            Json(json!({ "status": "healthy", "monitor": monitor })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unhealthy", "db": "disconnected", "monitor": monitor })),
        )
    }
}
