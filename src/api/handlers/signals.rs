use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::ExitLevels;
use crate::AppState;

/// PUT /api/signals/:id/exits: Signal owner seals hidden exit levels.
///
/// Write-only: the levels are never returned by any route.
pub async fn store_exits(
    State(state): State<AppState>,
    Path(signal_id): Path<Uuid>,
    Json(levels): Json<ExitLevels>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let signal = state
        .signals
        .get(signal_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("signal {signal_id}")))?;

    levels.validate(signal.side).map_err(AppError::BadRequest)?;

    state.exits.store(signal_id, &levels).await?;
    tracing::info!(signal_id = %signal_id, "Exit levels stored");

    Ok((
        StatusCode::OK,
        Json(json!({ "success": true, "signal_id": signal_id })),
    ))
}
