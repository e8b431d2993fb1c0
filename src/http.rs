use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::json;

use crate::state::ServerContext;

/// `GET /`: name, version, and the endpoint map a client uses to discover
/// the websocket route, mirroring the teacher's `mod health` simplicity
/// while carrying the richer body §6 asks for.
pub async fn index() -> Json<serde_json::Value> {
    Json(json!({
        "name": "synckit",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "websocket": "/ws",
            "health": "/health",
        },
    }))
}

/// `GET /health`: reports storage/pub-sub backend status without
/// failing the whole check when optional backends are unconfigured
/// (single-instance + memory-only is a supported deployment shape).
pub async fn health(State(ctx): State<Arc<ServerContext>>) -> Json<serde_json::Value> {
    let storage_status = if ctx.config.storage_enabled() {
        if ctx.storage.health_check().await.is_ok() {
            "connected"
        } else {
            "error"
        }
    } else {
        "memory-only"
    };

    let pubsub_status = if ctx.config.pubsub_enabled() {
        if ctx.pubsub.health_check().await.is_ok() {
            "connected"
        } else {
            "error"
        }
    } else {
        "single-instance"
    };

    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "storage": storage_status,
        "pubsub": pubsub_status,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn health_reports_memory_only_and_single_instance_without_urls() {
        let ctx = ServerContext::build(Config::default()).await.unwrap();
        let Json(body) = health(State(ctx)).await;
        assert_eq!(body["storage"], "memory-only");
        assert_eq!(body["pubsub"], "single-instance");
        assert_eq!(body["status"], "ok");
    }
}
