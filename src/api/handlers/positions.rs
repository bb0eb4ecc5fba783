use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use super::ApiResponse;
use crate::errors::AppError;
use crate::models::{ExecutionReport, OpenPosition, PositionStatus};
use crate::monitor::{CloseResult, OverrideMode};
use crate::AppState;

const DEFAULT_LIST_LIMIT: i64 = 100;
const MAX_LIST_LIMIT: i64 = 1_000;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

/// GET /api/positions: Most recent positions, optionally filtered by status.
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ApiResponse<Vec<OpenPosition>>>, AppError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<PositionStatus>)
        .transpose()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);

    let positions = state.ledger.list(status, limit).await?;
    Ok(Json(ApiResponse::ok(positions)))
}

/// POST /api/positions: A terminal reports an executed signal.
pub async fn create(
    State(state): State<AppState>,
    Json(report): Json<ExecutionReport>,
) -> Result<(StatusCode, Json<ApiResponse<OpenPosition>>), AppError> {
    let signal = state
        .signals
        .get(report.signal_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("signal {}", report.signal_id)))?;

    let position = state
        .orchestrator
        .record_execution(&signal, report)
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    Ok((StatusCode::CREATED, Json(ApiResponse::ok(position))))
}

#[derive(Debug, Deserialize)]
pub struct TicketRequest {
    pub broker_ticket: String,
}

/// PUT /api/positions/:id/ticket: Record a broker ticket received later.
pub async fn attach_ticket(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<TicketRequest>,
) -> Result<Json<ApiResponse<OpenPosition>>, AppError> {
    let position = state.orchestrator.attach_ticket(id, &req.broker_ticket).await?;
    Ok(Json(ApiResponse::ok(position)))
}

#[derive(Debug, Deserialize)]
pub struct CloseRequest {
    pub note: String,
    pub price: Option<Decimal>,
    #[serde(default)]
    pub mode: CloseMode,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseMode {
    #[default]
    Dispatch,
    LedgerOnly,
}

impl From<CloseMode> for OverrideMode {
    fn from(mode: CloseMode) -> Self {
        match mode {
            CloseMode::Dispatch => OverrideMode::Dispatch,
            CloseMode::LedgerOnly => OverrideMode::LedgerOnly,
        }
    }
}

/// POST /api/positions/:id/close: Operator override close.
pub async fn close(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CloseRequest>,
) -> Result<Json<ApiResponse<CloseResult>>, AppError> {
    if req.note.trim().is_empty() {
        return Err(AppError::BadRequest("a note is required for manual closes".into()));
    }

    let mut price = req.price;
    if price.is_none() && matches!(req.mode, CloseMode::Dispatch) {
        let position = state
            .ledger
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("position {id}")))?;
        let quote = state
            .oracle
            .get_price(&position.instrument)
            .await
            .map_err(|e| AppError::Conflict(e.to_string()))?;
        price = Some(quote.price);
    }

    let result = state
        .orchestrator
        .force_close(id, req.note.trim(), price, req.mode.into())
        .await?;

    Ok(Json(ApiResponse {
        success: result.success,
        error: result.error.clone(),
        data: Some(result),
    }))
}
