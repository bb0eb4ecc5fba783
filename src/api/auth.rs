use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::AppState;

/// Bearer tokens for the two route groups. `None` disables the check for
/// that group (dev mode).
#[derive(Debug, Clone, Default)]
pub struct ApiTokens {
    pub admin: Option<String>,
    pub terminal: Option<String>,
}

/// Operator and signal-owner routes.
pub async fn require_admin(State(state): State<AppState>, req: Request, next: Next) -> Response {
    check_bearer(state.tokens.admin.as_deref(), req, next).await
}

/// Terminal command queue routes.
pub async fn require_terminal(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    check_bearer(state.tokens.terminal.as_deref(), req, next).await
}

async fn check_bearer(expected: Option<&str>, req: Request, next: Next) -> Response {
    // No token configured → auth disabled
    let Some(expected) = expected.filter(|t| !t.is_empty()) else {
        return next.run(req).await;
    };

    let auth_header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());

    match auth_header.and_then(|v| v.strip_prefix("Bearer ")) {
        Some(token) if token == expected => next.run(req).await,
        Some(_) => (StatusCode::UNAUTHORIZED, "Invalid token").into_response(),
        None => (StatusCode::UNAUTHORIZED, "Missing or invalid Authorization header").into_response(),
    }
}
