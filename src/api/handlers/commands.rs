use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ApiResponse;
use crate::errors::AppError;
use crate::models::{CommandAck, TerminalCommand};
use crate::monitor::AckOutcome;
use crate::AppState;

const DEFAULT_POLL_LIMIT: i64 = 20;
const MAX_POLL_LIMIT: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    pub limit: Option<i64>,
}

/// GET /api/terminal/devices/:device_id/commands: Pending closes for a terminal.
pub async fn poll(
    State(state): State<AppState>,
    Path(device_id): Path<Uuid>,
    Query(query): Query<PollQuery>,
) -> Result<Json<ApiResponse<Vec<TerminalCommand>>>, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_POLL_LIMIT).clamp(1, MAX_POLL_LIMIT);
    let commands = state.queue.poll(device_id, limit).await?;

    if !commands.is_empty() {
        tracing::debug!(device_id = %device_id, count = commands.len(), "Delivering close commands");
    }

    Ok(Json(ApiResponse::ok(
        commands.iter().map(|c| c.to_terminal()).collect(),
    )))
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub command_id: Uuid,
    pub outcome: &'static str,
    pub duplicate: bool,
}

/// POST /api/terminal/commands/:command_id/ack: Terminal reports the close result.
pub async fn acknowledge(
    State(state): State<AppState>,
    Path(command_id): Path<Uuid>,
    Json(ack): Json<CommandAck>,
) -> Result<Json<ApiResponse<AckResponse>>, AppError> {
    let outcome = match state.orchestrator.acknowledge(command_id, &ack).await? {
        AckOutcome::NotFound => {
            return Err(AppError::NotFound(format!("command {command_id}")));
        }
        AckOutcome::Closed(_) => "closed",
        AckOutcome::CloseFailed(_) => "close_failed",
        AckOutcome::PositionAlreadyClosed => "position_already_closed",
        AckOutcome::Duplicate => "duplicate",
    };

    Ok(Json(ApiResponse::ok(AckResponse {
        command_id,
        outcome,
        duplicate: outcome == "duplicate",
    })))
}
