use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Map, Value};
use synckit_protocol::DocumentPermissions;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::info;
use uuid::Uuid;

use crate::pubsub::PubSub;

pub const AWARENESS_TIMEOUT_MS: i64 = 30_000;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A frame the hub wants delivered to one connection's write side; the
/// websocket task owns turning this into bytes via `synckit_protocol::encode_message`.
#[derive(Debug, Clone)]
pub struct OutgoingFrame {
    pub type_name: &'static str,
    pub payload: Value,
    pub timestamp: i64,
}

impl OutgoingFrame {
    fn new(type_name: &'static str, payload: Value) -> Self {
        Self {
            type_name,
            payload,
            timestamp: now_ms(),
        }
    }
}

pub type Outbound = tokio::sync::mpsc::UnboundedSender<OutgoingFrame>;

/// §3 `Connection`: exclusively owned by the hub.
pub struct ConnectionState {
    pub id: Uuid,
    pub ip: String,
    pub user_id: Option<String>,
    pub client_id: Option<String>,
    pub authenticated: bool,
    pub permissions: Option<DocumentPermissions>,
    pub subscriptions: HashSet<String>,
    pub awareness_subscriptions: HashSet<String>,
    pub connected_at_ms: i64,
}

pub struct ConnectionHandle {
    pub state: Mutex<ConnectionState>,
    pub outbound: Outbound,
}

impl ConnectionHandle {
    pub async fn send(&self, type_name: &'static str, payload: Value) {
        let _ = self.outbound.send(OutgoingFrame::new(type_name, payload));
    }

    pub async fn send_error(&self, code: &str, message: &str) {
        self.send(
            synckit_protocol::message_type::ERROR,
            json!({ "code": code, "message": message }),
        )
        .await;
    }
}

struct AwarenessEntry {
    state: Value,
    last_seen_ms: i64,
}

/// §3 `DocumentRoom`.
#[derive(Default)]
struct Room {
    state: Map<String, Value>,
    subscribers: HashSet<Uuid>,
    awareness: HashMap<String, AwarenessEntry>,
}

impl Room {
    fn is_empty(&self) -> bool {
        self.subscribers.is_empty() && self.awareness.is_empty()
    }
}

/// C7: connection & fan-out hub, grounded on `websocket.py`'s
/// `ConnectionManager` for semantics and on the teacher's `AppState`
/// for the concurrency shape (one registry lock, per-room lock).
pub struct Hub {
    connections: RwLock<HashMap<Uuid, Arc<ConnectionHandle>>>,
    rooms: RwLock<HashMap<String, Arc<Mutex<Room>>>>,
    pubsub: Option<Arc<dyn PubSub>>,
    server_id: String,
    self_ref: OnceCell<Weak<Hub>>,
}

impl Hub {
    #[must_use]
    pub fn new(pubsub: Option<Arc<dyn PubSub>>, server_id: String) -> Arc<Self> {
        let hub = Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            pubsub,
            server_id,
            self_ref: OnceCell::new(),
        });
        let _ = hub.self_ref.set(Arc::downgrade(&hub));
        hub
    }

    async fn get_or_create_room(&self, document_id: &str) -> Arc<Mutex<Room>> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(document_id) {
                return room.clone();
            }
        }
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Room::default())))
            .clone()
    }

    async fn connection(&self, id: Uuid) -> Option<Arc<ConnectionHandle>> {
        self.connections.read().await.get(&id).cloned()
    }

    /// Admits a new connection; returns its server-minted id.
    pub async fn register(&self, ip: String, outbound: Outbound) -> Uuid {
        let id = Uuid::new_v4();
        let handle = Arc::new(ConnectionHandle {
            state: Mutex::new(ConnectionState {
                id,
                ip,
                user_id: None,
                client_id: None,
                authenticated: false,
                permissions: None,
                subscriptions: HashSet::new(),
                awareness_subscriptions: HashSet::new(),
                connected_at_ms: now_ms(),
            }),
            outbound,
        });
        self.connections.write().await.insert(id, handle);
        info!(connection_id = %id, "connection registered");
        id
    }

    /// Removes a connection from every registry it appears in:
    /// subscriber sets, awareness maps, and the connection table itself
    /// (§3 invariant: bidirectional consistency; §4.7 disconnect rule).
    pub async fn unregister(&self, id: Uuid) {
        let Some(handle) = self.connections.write().await.remove(&id) else {
            return;
        };
        info!(connection_id = %id, "connection unregistered");
        let (subscriptions, client_id) = {
            let state = handle.state.lock().await;
            (state.subscriptions.clone(), state.client_id.clone())
        };

        let rooms_snapshot: Vec<(String, Arc<Mutex<Room>>)> = {
            let rooms = self.rooms.read().await;
            subscriptions
                .iter()
                .filter_map(|doc_id| rooms.get(doc_id).map(|r| (doc_id.clone(), r.clone())))
                .collect()
        };

        for (doc_id, room) in rooms_snapshot {
            let mut room_guard = room.lock().await;
            room_guard.subscribers.remove(&id);
            if let Some(client_id) = &client_id {
                if room_guard.awareness.remove(client_id).is_some() {
                    drop(room_guard);
                    self.broadcast_awareness_removal(&doc_id, client_id, Some(id))
                        .await;
                    room_guard = room.lock().await;
                }
            }
            let empty = room_guard.is_empty();
            drop(room_guard);
            if empty {
                self.rooms.write().await.remove(&doc_id);
            }
        }
    }

    pub async fn authenticate(
        &self,
        id: Uuid,
        user_id: Option<String>,
        client_id: Option<String>,
        permissions: DocumentPermissions,
    ) {
        if let Some(handle) = self.connection(id).await {
            let mut state = handle.state.lock().await;
            state.authenticated = true;
            state.user_id = user_id.clone();
            state.client_id = client_id.or_else(|| Some(id.to_string()));
            state.permissions = Some(permissions);
            drop(state);
            info!(connection_id = %id, user_id = user_id.as_deref().unwrap_or("anonymous"), "connection authenticated");
        }
    }

    pub async fn is_authenticated(&self, id: Uuid) -> bool {
        match self.connection(id).await {
            Some(handle) => handle.state.lock().await.authenticated,
            None => false,
        }
    }

    pub async fn can_read(&self, id: Uuid, document_id: &str) -> bool {
        match self.connection(id).await {
            Some(handle) => handle
                .state
                .lock()
                .await
                .permissions
                .as_ref()
                .is_some_and(|p| p.can_read(document_id)),
            None => false,
        }
    }

    pub async fn can_write(&self, id: Uuid, document_id: &str) -> bool {
        match self.connection(id).await {
            Some(handle) => handle
                .state
                .lock()
                .await
                .permissions
                .as_ref()
                .is_some_and(|p| p.can_write(document_id)),
            None => false,
        }
    }

    /// §4.7 subscription: admits `connection_id` as a subscriber of
    /// `document_id` and returns the room's current state for a
    /// `sync_response`.
    pub async fn subscribe(&self, connection_id: Uuid, document_id: &str) -> Map<String, Value> {
        let room = self.get_or_create_room(document_id).await;
        let is_first_subscriber = {
            let mut room_guard = room.lock().await;
            room_guard.subscribers.insert(connection_id);
            room_guard.subscribers.len() == 1
        };

        if let Some(handle) = self.connection(connection_id).await {
            handle.state.lock().await.subscriptions.insert(document_id.to_string());
        }

        if is_first_subscriber {
            self.wire_remote_subscription(document_id).await;
        }

        room.lock().await.state.clone()
    }

    pub async fn unsubscribe(&self, connection_id: Uuid, document_id: &str) {
        if let Some(handle) = self.connection(connection_id).await {
            handle.state.lock().await.subscriptions.remove(document_id);
        }
        let room = self.get_or_create_room(document_id).await;
        let mut room_guard = room.lock().await;
        room_guard.subscribers.remove(&connection_id);
        let empty = room_guard.is_empty();
        drop(room_guard);
        if empty {
            self.rooms.write().await.remove(document_id);
        }
    }

    async fn broadcast_to_room(&self, document_id: &str, exclude: Option<Uuid>, type_name: &'static str, payload: Value) {
        let room = self.get_or_create_room(document_id).await;
        let subscribers: Vec<Uuid> = room.lock().await.subscribers.iter().copied().collect();
        for sub_id in subscribers {
            if Some(sub_id) == exclude {
                continue;
            }
            if let Some(handle) = self.connection(sub_id).await {
                handle.send(type_name, payload.clone()).await;
            }
        }
    }

    /// §4.7 delta application: field-level last-writer-wins merge, then
    /// broadcast to every subscriber except the sender, then ack the
    /// sender. Cross-instance fan-out follows when pub/sub is wired.
    pub async fn apply_delta(&self, sender_id: Uuid, document_id: &str, changes: Map<String, Value>) {
        let room = self.get_or_create_room(document_id).await;
        {
            let mut room_guard = room.lock().await;
            for (k, v) in &changes {
                room_guard.state.insert(k.clone(), v.clone());
            }
        }

        let payload = json!({ "documentId": document_id, "changes": changes });
        self.broadcast_to_room(document_id, Some(sender_id), synckit_protocol::message_type::DELTA, payload.clone())
            .await;

        if let Some(handle) = self.connection(sender_id).await {
            handle
                .send(synckit_protocol::message_type::ACK, json!({ "documentId": document_id }))
                .await;
        }

        info!(connection_id = %sender_id, %document_id, "delta applied and fanned out");
        self.publish_remote_delta(document_id, payload).await;
    }

    pub async fn apply_delta_batch(&self, sender_id: Uuid, document_id: &str, deltas: Vec<Map<String, Value>>) {
        let room = self.get_or_create_room(document_id).await;
        {
            let mut room_guard = room.lock().await;
            for changes in &deltas {
                for (k, v) in changes {
                    room_guard.state.insert(k.clone(), v.clone());
                }
            }
        }

        for changes in &deltas {
            let payload = json!({ "documentId": document_id, "changes": changes });
            self.broadcast_to_room(document_id, Some(sender_id), synckit_protocol::message_type::DELTA, payload.clone())
                .await;
            self.publish_remote_delta(document_id, payload).await;
        }

        if let Some(handle) = self.connection(sender_id).await {
            handle
                .send(
                    synckit_protocol::message_type::ACK,
                    json!({ "documentId": document_id, "count": deltas.len() }),
                )
                .await;
        }
    }

    /// §4.7 awareness: stamps `_lastSeen`, stores presence, forwards to
    /// every other subscriber.
    pub async fn update_awareness(&self, sender_id: Uuid, document_id: &str, mut state: Value) {
        let client_id = match self.connection(sender_id).await {
            Some(handle) => {
                let mut conn_state = handle.state.lock().await;
                conn_state.awareness_subscriptions.insert(document_id.to_string());
                conn_state.client_id.clone().unwrap_or_else(|| sender_id.to_string())
            }
            None => return,
        };

        if let Value::Object(ref mut map) = state {
            map.insert("_lastSeen".to_string(), json!(now_ms() / 1000));
        }

        let room = self.get_or_create_room(document_id).await;
        room.lock().await.awareness.insert(
            client_id.clone(),
            AwarenessEntry {
                state: state.clone(),
                last_seen_ms: now_ms(),
            },
        );

        let payload = json!({ "documentId": document_id, "clientId": client_id, "state": state });
        self.broadcast_to_room(document_id, Some(sender_id), synckit_protocol::message_type::AWARENESS_STATE, payload)
            .await;
    }

    async fn broadcast_awareness_removal(&self, document_id: &str, client_id: &str, exclude: Option<Uuid>) {
        let payload = json!({ "documentId": document_id, "clientId": client_id, "state": Value::Null });
        self.broadcast_to_room(document_id, exclude, synckit_protocol::message_type::AWARENESS_UPDATE, payload)
            .await;
    }

    /// Periodic sweep (§4.7 "Awareness GC", every 30s): evicts presence
    /// entries silent for more than 30s, broadcasting a removal to each
    /// room's remaining subscribers.
    pub async fn sweep_stale_awareness(&self) {
        let now = now_ms();
        let rooms: Vec<(String, Arc<Mutex<Room>>)> = {
            let guard = self.rooms.read().await;
            guard.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        for (doc_id, room) in rooms {
            let stale: Vec<String> = {
                let room_guard = room.lock().await;
                room_guard
                    .awareness
                    .iter()
                    .filter(|(_, entry)| now - entry.last_seen_ms > AWARENESS_TIMEOUT_MS)
                    .map(|(client_id, _)| client_id.clone())
                    .collect()
            };
            if stale.is_empty() {
                continue;
            }
            {
                let mut room_guard = room.lock().await;
                for client_id in &stale {
                    room_guard.awareness.remove(client_id);
                }
            }
            for client_id in &stale {
                info!(document_id = %doc_id, %client_id, "awareness entry evicted as stale");
                self.broadcast_awareness_removal(&doc_id, client_id, None).await;
            }
        }
    }

    /// Wires a per-document remote-delta listener the first time a
    /// document gets a local subscriber (Design Note 5: outbound deltas
    /// are tagged with the originating server id so the listener can
    /// skip its own echo).
    async fn wire_remote_subscription(&self, document_id: &str) {
        let Some(pubsub) = self.pubsub.clone() else { return };
        let Some(weak_hub) = self.self_ref.get().cloned() else { return };
        let document_id = document_id.to_string();
        let server_id = self.server_id.clone();

        let handler: crate::pubsub::MessageHandler = Arc::new(move |value: Value| {
            let weak_hub = weak_hub.clone();
            let document_id = document_id.clone();
            let server_id = server_id.clone();
            tokio::spawn(async move {
                let Some(hub) = weak_hub.upgrade() else { return };
                hub.apply_remote_delta(&document_id, &server_id, value).await;
            });
        });

        let _ = pubsub.subscribe_to_document(&document_id, handler).await;
    }

    /// Applies a delta received from a peer instance without
    /// re-publishing it, breaking the cross-instance echo cycle.
    async fn apply_remote_delta(&self, document_id: &str, self_server_id: &str, payload: Value) {
        if payload.get("_originServerId").and_then(Value::as_str) == Some(self_server_id) {
            return;
        }
        let Some(changes) = payload.get("changes").and_then(Value::as_object).cloned() else {
            return;
        };
        let room = self.get_or_create_room(document_id).await;
        {
            let mut room_guard = room.lock().await;
            for (k, v) in &changes {
                room_guard.state.insert(k.clone(), v.clone());
            }
        }
        let local_payload = json!({ "documentId": document_id, "changes": changes });
        self.broadcast_to_room(document_id, None, synckit_protocol::message_type::DELTA, local_payload)
            .await;
    }

    async fn publish_remote_delta(&self, document_id: &str, mut payload: Value) {
        let Some(pubsub) = &self.pubsub else { return };
        if let Value::Object(ref mut map) = payload {
            map.insert("_originServerId".to_string(), json!(self.server_id));
        }
        let _ = pubsub.publish_delta(document_id, payload).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn channel() -> (Outbound, mpsc::UnboundedReceiver<OutgoingFrame>) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn delta_fan_out_excludes_the_sender() {
        let hub = Hub::new(None, "server-1".to_string());
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();
        let (tx_c, mut rx_c) = channel();
        let a = hub.register("1.1.1.1".to_string(), tx_a).await;
        let b = hub.register("1.1.1.2".to_string(), tx_b).await;
        let c = hub.register("1.1.1.3".to_string(), tx_c).await;

        for id in [a, b, c] {
            hub.authenticate(id, None, None, DocumentPermissions::admin()).await;
            hub.subscribe(id, "room:alpha").await;
        }

        let mut changes = Map::new();
        changes.insert("x".to_string(), json!(1));
        hub.apply_delta(a, "room:alpha", changes).await;

        let ack = rx_a.recv().await.unwrap();
        assert_eq!(ack.type_name, synckit_protocol::message_type::ACK);
        assert!(rx_a.try_recv().is_err(), "sender must not receive its own delta");

        let delta_b = rx_b.recv().await.unwrap();
        assert_eq!(delta_b.type_name, synckit_protocol::message_type::DELTA);
        assert_eq!(delta_b.payload["changes"]["x"], json!(1));

        let delta_c = rx_c.recv().await.unwrap();
        assert_eq!(delta_c.type_name, synckit_protocol::message_type::DELTA);
    }

    #[tokio::test]
    async fn disconnect_removes_subscriber_and_empties_the_room() {
        let hub = Hub::new(None, "server-1".to_string());
        let (tx, _rx) = channel();
        let id = hub.register("1.1.1.1".to_string(), tx).await;
        hub.authenticate(id, None, None, DocumentPermissions::admin()).await;
        hub.subscribe(id, "room:alpha").await;
        hub.unregister(id).await;
        assert!(hub.rooms.read().await.get("room:alpha").is_none());
    }

    #[tokio::test]
    async fn stale_awareness_is_evicted_and_broadcast_as_removal() {
        let hub = Hub::new(None, "server-1".to_string());
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();
        let a = hub.register("1.1.1.1".to_string(), tx_a).await;
        let b = hub.register("1.1.1.2".to_string(), tx_b).await;
        hub.authenticate(a, None, Some("client-a".to_string()), DocumentPermissions::admin())
            .await;
        hub.authenticate(b, None, Some("client-b".to_string()), DocumentPermissions::admin())
            .await;
        hub.subscribe(a, "room:alpha").await;
        hub.subscribe(b, "room:alpha").await;
        hub.update_awareness(a, "room:alpha", json!({"cursor": 1})).await;
        let _ = rx_b.recv().await.unwrap(); // awareness_state forwarded to b

        {
            let room = hub.get_or_create_room("room:alpha").await;
            let mut guard = room.lock().await;
            for entry in guard.awareness.values_mut() {
                entry.last_seen_ms -= AWARENESS_TIMEOUT_MS + 1_000;
            }
        }

        hub.sweep_stale_awareness().await;
        let removal = rx_b.recv().await.unwrap();
        assert_eq!(removal.type_name, synckit_protocol::message_type::AWARENESS_UPDATE);
        assert_eq!(removal.payload["state"], Value::Null);
        assert!(rx_a.try_recv().is_err() || matches!(rx_a.try_recv(), Err(_)));
    }
}
