use async_trait::async_trait;
use serde_json::Value;

use super::{MessageHandler, PresenceHandler, PubSub, PubSubResult, PubSubStats};

/// No-op backend for single-instance deployments (`REDIS_URL` unset).
/// Publishes are dropped; subscriptions are accepted but never fire.
#[derive(Default)]
pub struct NullPubSub;

impl NullPubSub {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PubSub for NullPubSub {
    async fn connect(&self) -> PubSubResult<()> {
        Ok(())
    }

    async fn disconnect(&self) -> PubSubResult<()> {
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        true
    }

    async fn health_check(&self) -> PubSubResult<()> {
        Ok(())
    }

    async fn publish_delta(&self, _document_id: &str, _payload: Value) -> PubSubResult<()> {
        Ok(())
    }

    async fn subscribe_to_document(&self, _document_id: &str, _handler: MessageHandler) -> PubSubResult<()> {
        Ok(())
    }

    async fn unsubscribe_from_document(&self, _document_id: &str) -> PubSubResult<()> {
        Ok(())
    }

    async fn publish_broadcast(&self, _payload: Value) -> PubSubResult<()> {
        Ok(())
    }

    async fn subscribe_to_broadcast(&self, _handler: MessageHandler) -> PubSubResult<()> {
        Ok(())
    }

    async fn announce_presence(&self, _server_id: &str, _metadata: Option<Value>) -> PubSubResult<()> {
        Ok(())
    }

    async fn announce_shutdown(&self, _server_id: &str) -> PubSubResult<()> {
        Ok(())
    }

    async fn subscribe_to_presence(&self, _handler: PresenceHandler) -> PubSubResult<()> {
        Ok(())
    }

    async fn stats(&self) -> PubSubStats {
        PubSubStats {
            connected: true,
            subscribed_channels: 0,
            total_handlers: 0,
        }
    }
}
