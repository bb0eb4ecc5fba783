use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::auth::{require_admin, require_terminal};
use super::handlers;
use crate::AppState;

pub fn create_router(state: AppState) -> Router {
    // Public routes: no authentication required
    let public = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::metrics::render));

    // Terminal routes: report executions, poll and acknowledge close commands
    let terminal = Router::new()
        .route("/api/positions", post(handlers::positions::create))
        .route("/api/positions/:id/ticket", put(handlers::positions::attach_ticket))
        .route(
            "/api/terminal/devices/:device_id/commands",
            get(handlers::commands::poll),
        )
        .route(
            "/api/terminal/commands/:command_id/ack",
            post(handlers::commands::acknowledge),
        )
        .layer(middleware::from_fn_with_state(state.clone(), require_terminal));

    // Admin routes: position review and override, signal owners, monitor control
    let admin = Router::new()
        .route("/api/positions", get(handlers::positions::list))
        .route("/api/positions/:id/close", post(handlers::positions::close))
        .route("/api/signals/:id/exits", put(handlers::signals::store_exits))
        .route("/api/control/pause", post(handlers::control::pause))
        .route("/api/control/resume", post(handlers::control::resume))
        .route("/api/control/status", get(handlers::control::status))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    public
        .merge(terminal)
        .merge(admin)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
