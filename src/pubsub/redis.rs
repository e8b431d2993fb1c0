use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use super::{
    document_channel, broadcast_channel, presence_channel, MessageHandler, PresenceEvent,
    PresenceHandler, PubSub, PubSubError, PubSubResult, PubSubStats,
};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(50);
const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(2);

enum ListenerCommand {
    Subscribe(String),
    Unsubscribe(String),
}

/// Redis-backed cross-instance coordination, grounded on
/// `storage/redis.py`'s `RedisPubSub`: a dedicated publisher connection
/// (via `ConnectionManager`, which reconnects transparently) plus a
/// single subscriber connection driven by one listener task that fans
/// incoming messages out to per-channel handler sets.
pub struct RedisPubSub {
    url: String,
    prefix: String,
    max_retries: u32,
    retry_delay: Duration,
    max_retry_delay: Duration,

    publisher: RwLock<Option<ConnectionManager>>,
    document_handlers: Arc<RwLock<HashMap<String, Vec<MessageHandler>>>>,
    broadcast_handlers: Arc<RwLock<Vec<MessageHandler>>>,
    presence_handlers: Arc<RwLock<Vec<PresenceHandler>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    listener_commands: Mutex<Option<mpsc::UnboundedSender<ListenerCommand>>>,
}

impl RedisPubSub {
    #[must_use]
    pub fn new(url: impl Into<String>, channel_prefix: impl Into<String>) -> Self {
        let prefix = channel_prefix.into();
        let prefix = if prefix.ends_with(':') { prefix } else { format!("{prefix}:") };
        Self {
            url: url.into(),
            prefix,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
            publisher: RwLock::new(None),
            document_handlers: Arc::new(RwLock::new(HashMap::new())),
            broadcast_handlers: Arc::new(RwLock::new(Vec::new())),
            presence_handlers: Arc::new(RwLock::new(Vec::new())),
            listener: Mutex::new(None),
            listener_commands: Mutex::new(None),
        }
    }

    async fn connect_with_retry(&self) -> PubSubResult<ConnectionManager> {
        let client = Client::open(self.url.as_str())
            .map_err(|e| PubSubError::Connection(e.to_string()))?;
        let mut delay = self.retry_delay;
        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            match client.get_connection_manager().await {
                Ok(manager) => return Ok(manager),
                Err(e) => {
                    last_err = Some(e);
                    if attempt < self.max_retries {
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(self.max_retry_delay);
                    }
                }
            }
        }
        Err(PubSubError::Connection(
            last_err.map(|e| e.to_string()).unwrap_or_else(|| "unknown error".to_string()),
        ))
    }

    fn document_channel(&self, document_id: &str) -> String {
        document_channel(&self.prefix, document_id)
    }

    fn broadcast_channel(&self) -> String {
        broadcast_channel(&self.prefix)
    }

    fn presence_channel(&self) -> String {
        presence_channel(&self.prefix)
    }

    async fn publish(&self, channel: &str, payload: &Value) -> PubSubResult<()> {
        let text = serde_json::to_string(payload)
            .map_err(|e| PubSubError::Transport(e.to_string()))?;
        let mut guard = self.publisher.write().await;
        let manager = guard
            .as_mut()
            .ok_or_else(|| PubSubError::Connection("not connected".to_string()))?;
        manager
            .publish::<_, _, ()>(channel, text)
            .await
            .map_err(|e| PubSubError::Transport(e.to_string()))
    }

    fn spawn_listener(&self, client: Client) -> (JoinHandle<()>, mpsc::UnboundedSender<ListenerCommand>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<ListenerCommand>();
        let document_handlers = self.document_handlers.clone();
        let broadcast_handlers = self.broadcast_handlers.clone();
        let presence_handlers = self.presence_handlers.clone();
        let presence_channel_name = self.presence_channel();

        let handle = tokio::spawn(async move {
            let Ok(conn) = client.get_async_connection().await else {
                return;
            };
            let mut pubsub = conn.into_pubsub();

            loop {
                tokio::select! {
                    cmd = rx.recv() => {
                        match cmd {
                            Some(ListenerCommand::Subscribe(channel)) => {
                                let _ = pubsub.subscribe(channel).await;
                            }
                            Some(ListenerCommand::Unsubscribe(channel)) => {
                                let _ = pubsub.unsubscribe(channel).await;
                            }
                            None => break,
                        }
                    }
                    msg = pubsub.on_message().next() => {
                        let Some(msg) = msg else { break };
                        let channel: String = msg.get_channel_name().to_string();
                        let payload: String = match msg.get_payload() {
                            Ok(p) => p,
                            Err(_) => continue,
                        };
                        let Ok(value) = serde_json::from_str::<Value>(&payload) else { continue };

                        if channel == presence_channel_name {
                            let event_type = value.get("type").and_then(Value::as_str).unwrap_or("");
                            let server_id = value
                                .get("serverId")
                                .and_then(Value::as_str)
                                .unwrap_or("")
                                .to_string();
                            let metadata = value.get("metadata").cloned();
                            let event = match event_type {
                                "server_online" => Some(PresenceEvent::Online),
                                "server_offline" => Some(PresenceEvent::Offline),
                                _ => None,
                            };
                            if let Some(event) = event {
                                for handler in presence_handlers.read().await.iter() {
                                    handler(event.clone(), server_id.clone(), metadata.clone());
                                }
                            }
                            continue;
                        }

                        if let Some(handlers) = document_handlers.read().await.get(&channel) {
                            for handler in handlers {
                                handler(value.clone());
                            }
                        }
                        for handler in broadcast_handlers.read().await.iter() {
                            handler(value.clone());
                        }
                    }
                }
            }
        });

        (handle, tx)
    }
}

#[async_trait]
impl PubSub for RedisPubSub {
    async fn connect(&self) -> PubSubResult<()> {
        let manager = self.connect_with_retry().await?;
        *self.publisher.write().await = Some(manager);

        let client = Client::open(self.url.as_str())
            .map_err(|e| PubSubError::Connection(e.to_string()))?;
        let (handle, tx) = self.spawn_listener(client);
        *self.listener.lock().await = Some(handle);
        *self.listener_commands.lock().await = Some(tx);
        Ok(())
    }

    async fn disconnect(&self) -> PubSubResult<()> {
        if let Some(tx) = self.listener_commands.lock().await.take() {
            drop(tx);
        }
        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
        }
        *self.publisher.write().await = None;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.publisher.read().await.is_some()
    }

    async fn health_check(&self) -> PubSubResult<()> {
        let mut guard = self.publisher.write().await;
        let manager = guard
            .as_mut()
            .ok_or_else(|| PubSubError::Connection("not connected".to_string()))?;
        redis::cmd("PING")
            .query_async::<_, String>(manager)
            .await
            .map_err(|e| PubSubError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn publish_delta(&self, document_id: &str, payload: Value) -> PubSubResult<()> {
        let channel = self.document_channel(document_id);
        self.publish(&channel, &payload).await
    }

    async fn subscribe_to_document(&self, document_id: &str, handler: MessageHandler) -> PubSubResult<()> {
        let channel = self.document_channel(document_id);
        let mut handlers = self.document_handlers.write().await;
        let is_first = !handlers.contains_key(&channel);
        handlers.entry(channel.clone()).or_default().push(handler);
        drop(handlers);
        if is_first {
            if let Some(tx) = self.listener_commands.lock().await.as_ref() {
                let _ = tx.send(ListenerCommand::Subscribe(channel));
            }
        }
        Ok(())
    }

    async fn unsubscribe_from_document(&self, document_id: &str) -> PubSubResult<()> {
        let channel = self.document_channel(document_id);
        self.document_handlers.write().await.remove(&channel);
        if let Some(tx) = self.listener_commands.lock().await.as_ref() {
            let _ = tx.send(ListenerCommand::Unsubscribe(channel));
        }
        Ok(())
    }

    async fn publish_broadcast(&self, payload: Value) -> PubSubResult<()> {
        let channel = self.broadcast_channel();
        self.publish(&channel, &payload).await
    }

    async fn subscribe_to_broadcast(&self, handler: MessageHandler) -> PubSubResult<()> {
        let channel = self.broadcast_channel();
        let is_first = self.broadcast_handlers.read().await.is_empty();
        self.broadcast_handlers.write().await.push(handler);
        if is_first {
            if let Some(tx) = self.listener_commands.lock().await.as_ref() {
                let _ = tx.send(ListenerCommand::Subscribe(channel));
            }
        }
        Ok(())
    }

    async fn announce_presence(&self, server_id: &str, metadata: Option<Value>) -> PubSubResult<()> {
        let channel = self.presence_channel();
        let payload = json!({
            "type": "server_online",
            "serverId": server_id,
            "timestamp": chrono::Utc::now().timestamp_millis(),
            "metadata": metadata,
        });
        self.publish(&channel, &payload).await
    }

    async fn announce_shutdown(&self, server_id: &str) -> PubSubResult<()> {
        let channel = self.presence_channel();
        let payload = json!({
            "type": "server_offline",
            "serverId": server_id,
            "timestamp": chrono::Utc::now().timestamp_millis(),
        });
        self.publish(&channel, &payload).await
    }

    async fn subscribe_to_presence(&self, handler: PresenceHandler) -> PubSubResult<()> {
        let channel = self.presence_channel();
        let is_first = self.presence_handlers.read().await.is_empty();
        self.presence_handlers.write().await.push(handler);
        if is_first {
            if let Some(tx) = self.listener_commands.lock().await.as_ref() {
                let _ = tx.send(ListenerCommand::Subscribe(channel));
            }
        }
        Ok(())
    }

    async fn stats(&self) -> PubSubStats {
        let document_channels = self.document_handlers.read().await.len();
        let broadcast = usize::from(!self.broadcast_handlers.read().await.is_empty());
        let presence = usize::from(!self.presence_handlers.read().await.is_empty());
        let total_handlers = self
            .document_handlers
            .read()
            .await
            .values()
            .map(Vec::len)
            .sum::<usize>()
            + self.broadcast_handlers.read().await.len()
            + self.presence_handlers.read().await.len();
        PubSubStats {
            connected: self.is_connected().await,
            subscribed_channels: document_channels + broadcast + presence,
            total_handlers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_prefix_gets_a_trailing_colon() {
        let ps = RedisPubSub::new("redis://localhost", "synckit");
        assert_eq!(ps.document_channel("doc-1"), "synckit:doc:doc-1");
        let ps2 = RedisPubSub::new("redis://localhost", "synckit:");
        assert_eq!(ps2.document_channel("doc-1"), "synckit:doc:doc-1");
    }
}
