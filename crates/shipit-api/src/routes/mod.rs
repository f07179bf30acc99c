//! API routes.

pub mod health;
pub mod projects;

use crate::AppState;
use crate::ws::ws_handler;
use axum::Router;
use axum::routing::get;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(projects::router())
        .route("/ws", get(ws_handler))
        .merge(health::router())
        .with_state(state)
}
