//! HTTP API surface.

pub mod auth;
pub mod chat;

use axum::middleware;
use axum::routing::post;
use axum::Router;

use crate::state::AppState;

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/api/chat", post(chat::chat))
        .layer(middleware::from_fn_with_state(
            state,
            auth::require_ghost_key,
        ))
}
