//! API routes.

pub mod builds;
pub mod health;
pub mod jobs;
pub mod workers;

use axum::Router;
use axum::routing::get;

use crate::AppState;
use crate::ws::ws_handler;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_router(state.clone()))
        .route("/ws", get(ws_handler))
        .merge(health::router())
        .with_state(state)
}

fn api_router(state: AppState) -> Router<AppState> {
    Router::new()
        .nest("/jobs", jobs::router())
        .nest("/builds", builds::router())
        .nest("/workers", workers::router())
        .with_state(state)
}
