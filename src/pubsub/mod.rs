pub mod null;
pub mod redis;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("pub/sub connection error: {0}")]
    Connection(String),
    #[error("pub/sub transport error: {0}")]
    Transport(String),
}

pub type PubSubResult<T> = Result<T, PubSubError>;

/// Presence events a `presence` channel subscriber receives (§4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Online,
    Offline,
}

#[derive(Debug, Clone, Default)]
pub struct PubSubStats {
    pub connected: bool,
    pub subscribed_channels: usize,
    pub total_handlers: usize,
}

pub type MessageHandler = std::sync::Arc<dyn Fn(Value) + Send + Sync>;
pub type PresenceHandler = std::sync::Arc<dyn Fn(PresenceEvent, String, Option<Value>) + Send + Sync>;

/// Cross-instance coordination contract (§4.6). A delta published on one
/// instance's document channel must reach every peer instance's
/// subscriber for that document.
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn connect(&self) -> PubSubResult<()>;
    async fn disconnect(&self) -> PubSubResult<()>;
    async fn is_connected(&self) -> bool;
    async fn health_check(&self) -> PubSubResult<()>;

    async fn publish_delta(&self, document_id: &str, payload: Value) -> PubSubResult<()>;
    async fn subscribe_to_document(&self, document_id: &str, handler: MessageHandler) -> PubSubResult<()>;
    async fn unsubscribe_from_document(&self, document_id: &str) -> PubSubResult<()>;

    async fn publish_broadcast(&self, payload: Value) -> PubSubResult<()>;
    async fn subscribe_to_broadcast(&self, handler: MessageHandler) -> PubSubResult<()>;

    async fn announce_presence(&self, server_id: &str, metadata: Option<Value>) -> PubSubResult<()>;
    async fn announce_shutdown(&self, server_id: &str) -> PubSubResult<()>;
    async fn subscribe_to_presence(&self, handler: PresenceHandler) -> PubSubResult<()>;

    async fn stats(&self) -> PubSubStats;
}

/// Channel naming helpers shared by every backend, grounded on
/// `storage/redis.py`'s `_get_document_channel` etc.
#[must_use]
pub fn document_channel(prefix: &str, document_id: &str) -> String {
    format!("{prefix}doc:{document_id}")
}

#[must_use]
pub fn broadcast_channel(prefix: &str) -> String {
    format!("{prefix}broadcast")
}

#[must_use]
pub fn presence_channel(prefix: &str) -> String {
    format!("{prefix}presence")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_are_namespaced_by_prefix() {
        assert_eq!(document_channel("synckit:", "doc-1"), "synckit:doc:doc-1");
        assert_eq!(broadcast_channel("synckit:"), "synckit:broadcast");
        assert_eq!(presence_channel("synckit:"), "synckit:presence");
    }
}
