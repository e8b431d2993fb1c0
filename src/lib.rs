pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod http;
pub mod hub;
pub mod pubsub;
pub mod security;
pub mod state;
pub mod storage;
pub mod ws;

pub use state::ServerContext;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;

/// Assembles the full router: websocket route plus the HTTP surface from
/// §6, mirroring the teacher's `build_router`.
#[must_use]
pub fn build_router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/", get(http::index))
        .route("/health", get(http::health))
        .route("/ws", get(ws::ws_handler))
        .with_state(ctx)
}
