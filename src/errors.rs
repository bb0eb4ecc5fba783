use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::monitor::PositionActionError;
use crate::vault::VaultError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".into())
            }
        };

        (
            status,
            Json(ErrorBody {
                success: false,
                error: message,
            }),
        )
            .into_response()
    }
}

impl From<PositionActionError> for AppError {
    fn from(e: PositionActionError) -> Self {
        match e {
            PositionActionError::NotFound(_) => AppError::NotFound(e.to_string()),
            PositionActionError::NotOpen(_) | PositionActionError::InFlight(_) => {
                AppError::Conflict(e.to_string())
            }
            PositionActionError::Invalid(msg) => AppError::BadRequest(msg),
            PositionActionError::Internal(inner) => AppError::Internal(inner),
        }
    }
}

// Decryption details never reach a response body.
impl From<VaultError> for AppError {
    fn from(e: VaultError) -> Self {
        match e {
            VaultError::NotFound(id) => AppError::NotFound(format!("signal {id}")),
            VaultError::AlreadySealed(id) => {
                AppError::Conflict(format!("exit levels for signal {id} are already set"))
            }
            VaultError::Storage(inner) => AppError::Internal(inner),
            other => AppError::Internal(anyhow::anyhow!("exit store error: {other}")),
        }
    }
}
