use serde_json::{json, Value};
use synckit_protocol::{message_type, DecodedMessage, DocumentPermissions};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::TokenIssuer;
use crate::hub::Hub;
use crate::security::{can_access_document, validate_document_id, SecurityManager};

/// C8: the per-message handler table. `dispatch` is called once per
/// decoded frame; framing failures never reach here (§7: those are
/// transport-fatal and handled by the websocket task before dispatch).
pub struct Dispatcher {
    pub hub: std::sync::Arc<Hub>,
    pub security: std::sync::Arc<SecurityManager>,
    pub tokens: std::sync::Arc<TokenIssuer>,
    pub auth_required: bool,
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl Dispatcher {
    /// Validates basic message shape: the payload must be a JSON object
    /// (§4.8's "shape validator"). Decoding already guarantees this for
    /// binary frames whose payload parses as a JSON object, but textual
    /// fallback or an array/scalar payload can still slip through.
    fn validate_shape(decoded: &DecodedMessage) -> bool {
        decoded.payload.is_object()
    }

    pub async fn dispatch(&self, connection_id: Uuid, ip: &str, decoded: DecodedMessage) -> Option<(&'static str, Value)> {
        let now = now_ms();

        if !self
            .security
            .messages_by_connection
            .try_admit(&connection_id.to_string(), now)
            .await
            || !self.security.messages_by_ip.try_admit(ip, now).await
        {
            warn!(%connection_id, %ip, "rate limit exceeded");
            return Some((
                message_type::ERROR,
                json!({ "code": synckit_protocol::error_codes::RATE_LIMIT_EXCEEDED, "message": "rate limit exceeded" }),
            ));
        }

        if !Self::validate_shape(&decoded) {
            return Some((
                message_type::ERROR,
                json!({ "code": synckit_protocol::error_codes::INVALID_MESSAGE, "message": "payload must be a JSON object" }),
            ));
        }

        if !synckit_protocol::is_known_type(&decoded.message_type) {
            return Some((
                message_type::ERROR,
                json!({ "code": synckit_protocol::error_codes::UNKNOWN_MESSAGE_TYPE, "message": format!("unknown message type {}", decoded.message_type) }),
            ));
        }

        match decoded.message_type.as_str() {
            message_type::AUTH => self.handle_auth(connection_id, &decoded.payload).await,
            message_type::PING => Some((message_type::PONG, decoded.payload.clone())),
            message_type::SUBSCRIBE => self.handle_subscribe(connection_id, &decoded.payload).await,
            message_type::UNSUBSCRIBE => self.handle_unsubscribe(connection_id, &decoded.payload).await,
            message_type::DELTA => self.handle_delta(connection_id, &decoded.payload).await,
            message_type::DELTA_BATCH => self.handle_delta_batch(connection_id, &decoded.payload).await,
            message_type::AWARENESS_UPDATE => self.handle_awareness_update(connection_id, &decoded.payload).await,
            message_type::AWARENESS_SUBSCRIBE => self.handle_awareness_subscribe(connection_id, &decoded.payload).await,
            _ => None,
        }
    }

    async fn handle_auth(&self, connection_id: Uuid, payload: &Value) -> Option<(&'static str, Value)> {
        let token = payload.get("token").and_then(Value::as_str);

        let Some(token) = token else {
            if self.auth_required {
                warn!(%connection_id, "auth failed: token required");
                return Some((
                    message_type::AUTH_ERROR,
                    json!({ "code": synckit_protocol::error_codes::AUTH_REQUIRED, "message": "a token is required" }),
                ));
            }
            self.hub
                .authenticate(connection_id, None, None, DocumentPermissions::anonymous())
                .await;
            info!(%connection_id, "auth succeeded: anonymous");
            return Some((
                message_type::AUTH_SUCCESS,
                json!({ "userId": Value::Null, "permissions": DocumentPermissions::anonymous() }),
            ));
        };

        match self.tokens.verify(token) {
            Some(claims) => {
                self.hub
                    .authenticate(
                        connection_id,
                        Some(claims.user_id.clone()),
                        Some(claims.user_id.clone()),
                        claims.permissions.clone(),
                    )
                    .await;
                info!(%connection_id, user_id = %claims.user_id, "auth succeeded");
                Some((
                    message_type::AUTH_SUCCESS,
                    json!({ "userId": claims.user_id, "permissions": claims.permissions }),
                ))
            }
            None => {
                warn!(%connection_id, "auth failed: token verification failed");
                Some((
                    message_type::AUTH_ERROR,
                    json!({ "code": synckit_protocol::error_codes::INVALID_TOKEN, "message": "token verification failed" }),
                ))
            }
        }
    }

    async fn handle_subscribe(&self, connection_id: Uuid, payload: &Value) -> Option<(&'static str, Value)> {
        if !self.hub.is_authenticated(connection_id).await {
            return Some(not_authenticated());
        }
        let Some(document_id) = payload.get("documentId").and_then(Value::as_str) else {
            return Some(invalid_request("documentId is required"));
        };
        if let Err(reason) = validate_document_id(document_id) {
            return Some((
                message_type::ERROR,
                json!({ "code": synckit_protocol::error_codes::INVALID_DOCUMENT_ID, "message": reason }),
            ));
        }
        if !can_access_document(document_id) {
            warn!(%connection_id, %document_id, "subscribe denied: not a public namespace");
            return Some((
                message_type::ERROR,
                json!({ "code": synckit_protocol::error_codes::ACCESS_DENIED, "message": "document is not in a public namespace" }),
            ));
        }
        if !self.hub.can_read(connection_id, document_id).await {
            warn!(%connection_id, %document_id, "subscribe denied: no read permission");
            return Some((
                message_type::ERROR,
                json!({ "code": synckit_protocol::error_codes::PERMISSION_DENIED, "message": "read access denied" }),
            ));
        }
        info!(%connection_id, %document_id, "subscribed");
        let state = self.hub.subscribe(connection_id, document_id).await;
        Some((
            message_type::SYNC_RESPONSE,
            json!({ "documentId": document_id, "state": Value::Object(state), "vectorClock": {} }),
        ))
    }

    async fn handle_unsubscribe(&self, connection_id: Uuid, payload: &Value) -> Option<(&'static str, Value)> {
        let Some(document_id) = payload.get("documentId").and_then(Value::as_str) else {
            return Some(invalid_request("documentId is required"));
        };
        self.hub.unsubscribe(connection_id, document_id).await;
        None
    }

    async fn handle_delta(&self, connection_id: Uuid, payload: &Value) -> Option<(&'static str, Value)> {
        if !self.hub.is_authenticated(connection_id).await {
            return Some(not_authenticated());
        }
        let Some(document_id) = payload.get("documentId").and_then(Value::as_str) else {
            return Some(invalid_request("documentId is required"));
        };
        if !self.hub.can_write(connection_id, document_id).await {
            warn!(%connection_id, %document_id, "delta denied: no write permission");
            return Some((
                message_type::ERROR,
                json!({ "code": synckit_protocol::error_codes::PERMISSION_DENIED, "message": "write access denied" }),
            ));
        }
        let changes = payload
            .get("changes")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        self.hub.apply_delta(connection_id, document_id, changes).await;
        None
    }

    async fn handle_delta_batch(&self, connection_id: Uuid, payload: &Value) -> Option<(&'static str, Value)> {
        if !self.hub.is_authenticated(connection_id).await {
            return Some(not_authenticated());
        }
        let Some(document_id) = payload.get("documentId").and_then(Value::as_str) else {
            return Some(invalid_request("documentId is required"));
        };
        if !self.hub.can_write(connection_id, document_id).await {
            warn!(%connection_id, %document_id, "delta batch denied: no write permission");
            return Some((
                message_type::ERROR,
                json!({ "code": synckit_protocol::error_codes::PERMISSION_DENIED, "message": "write access denied" }),
            ));
        }
        let deltas: Vec<serde_json::Map<String, Value>> = payload
            .get("deltas")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_object().cloned())
                    .collect()
            })
            .unwrap_or_default();
        self.hub.apply_delta_batch(connection_id, document_id, deltas).await;
        None
    }

    async fn handle_awareness_update(&self, connection_id: Uuid, payload: &Value) -> Option<(&'static str, Value)> {
        let Some(document_id) = payload.get("documentId").and_then(Value::as_str) else {
            return Some(invalid_request("documentId is required"));
        };
        let state = payload.get("state").cloned().unwrap_or(Value::Object(Default::default()));
        self.hub.update_awareness(connection_id, document_id, state).await;
        None
    }

    async fn handle_awareness_subscribe(&self, connection_id: Uuid, payload: &Value) -> Option<(&'static str, Value)> {
        let Some(document_id) = payload.get("documentId").and_then(Value::as_str) else {
            return Some(invalid_request("documentId is required"));
        };
        self.hub.subscribe(connection_id, document_id).await;
        None
    }
}

fn not_authenticated() -> (&'static str, Value) {
    (
        message_type::ERROR,
        json!({ "code": synckit_protocol::error_codes::NOT_AUTHENTICATED, "message": "authenticate before sending this message" }),
    )
}

fn invalid_request(message: &str) -> (&'static str, Value) {
    (
        message_type::ERROR,
        json!({ "code": synckit_protocol::error_codes::INVALID_REQUEST, "message": message }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use crate::security::SecurityManager;
    use synckit_protocol::decode_message;
    use tokio::sync::mpsc;

    fn make_dispatcher(auth_required: bool) -> Dispatcher {
        Dispatcher {
            hub: Hub::new(None, "server-1".to_string()),
            security: std::sync::Arc::new(SecurityManager::new()),
            tokens: std::sync::Arc::new(TokenIssuer::new("a-32-byte-or-longer-test-secret!", 24)),
            auth_required,
        }
    }

    fn decoded(type_name: &str, payload: Value) -> DecodedMessage {
        let frame = synckit_protocol::encode_message(type_name, &payload, now_ms());
        decode_message(&frame).unwrap()
    }

    #[tokio::test]
    async fn ping_replies_with_pong_and_same_fields() {
        let dispatcher = make_dispatcher(false);
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = dispatcher.hub.register("1.2.3.4".to_string(), tx).await;
        let msg = decoded(message_type::PING, json!({"id": "p1"}));
        let (reply_type, reply_payload) = dispatcher.dispatch(id, "1.2.3.4", msg).await.unwrap();
        assert_eq!(reply_type, message_type::PONG);
        assert_eq!(reply_payload["id"], "p1");
    }

    #[tokio::test]
    async fn subscribe_before_auth_is_rejected() {
        let dispatcher = make_dispatcher(true);
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = dispatcher.hub.register("1.2.3.4".to_string(), tx).await;
        let msg = decoded(message_type::SUBSCRIBE, json!({"documentId": "room:lobby"}));
        let (reply_type, reply_payload) = dispatcher.dispatch(id, "1.2.3.4", msg).await.unwrap();
        assert_eq!(reply_type, message_type::ERROR);
        assert_eq!(reply_payload["code"], synckit_protocol::error_codes::NOT_AUTHENTICATED);
    }

    #[tokio::test]
    async fn anonymous_auth_then_public_namespace_subscribe_succeeds() {
        let dispatcher = make_dispatcher(false);
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = dispatcher.hub.register("1.2.3.4".to_string(), tx).await;

        let auth_msg = decoded(message_type::AUTH, json!({}));
        let (auth_reply, _) = dispatcher.dispatch(id, "1.2.3.4", auth_msg).await.unwrap();
        assert_eq!(auth_reply, message_type::AUTH_SUCCESS);

        let sub_msg = decoded(message_type::SUBSCRIBE, json!({"documentId": "playground:demo"}));
        let (reply_type, reply_payload) = dispatcher.dispatch(id, "1.2.3.4", sub_msg).await.unwrap();
        assert_eq!(reply_type, message_type::SYNC_RESPONSE);
        assert_eq!(reply_payload["documentId"], "playground:demo");
        assert_eq!(reply_payload["state"], json!({}));
    }

    #[tokio::test]
    async fn invalid_document_id_is_rejected() {
        let dispatcher = make_dispatcher(false);
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = dispatcher.hub.register("1.2.3.4".to_string(), tx).await;
        dispatcher
            .hub
            .authenticate(id, None, None, DocumentPermissions::admin())
            .await;

        let msg = decoded(message_type::SUBSCRIBE, json!({"documentId": "bad id!"}));
        let (reply_type, reply_payload) = dispatcher.dispatch(id, "1.2.3.4", msg).await.unwrap();
        assert_eq!(reply_type, message_type::ERROR);
        assert_eq!(reply_payload["code"], synckit_protocol::error_codes::INVALID_DOCUMENT_ID);
    }

    #[tokio::test]
    async fn unknown_type_produces_unknown_message_type_error() {
        let dispatcher = make_dispatcher(false);
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = dispatcher.hub.register("1.2.3.4".to_string(), tx).await;
        let frame = synckit_protocol::encode_message("not_a_real_type", &json!({}), now_ms());
        let msg = decode_message(&frame).unwrap();
        let (reply_type, reply_payload) = dispatcher.dispatch(id, "1.2.3.4", msg).await.unwrap();
        assert_eq!(reply_type, message_type::ERROR);
        assert_eq!(reply_payload["code"], synckit_protocol::error_codes::UNKNOWN_MESSAGE_TYPE);
    }

    #[tokio::test]
    async fn five_hundred_and_first_message_in_a_minute_trips_rate_limit() {
        let dispatcher = make_dispatcher(false);
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = dispatcher.hub.register("1.2.3.4".to_string(), tx).await;
        for _ in 0..crate::security::rate_limit::limits::MAX_MESSAGES_PER_MINUTE {
            let msg = decoded(message_type::PING, json!({}));
            let (reply_type, _) = dispatcher.dispatch(id, "1.2.3.4", msg).await.unwrap();
            assert_eq!(reply_type, message_type::PONG);
        }
        let msg = decoded(message_type::PING, json!({}));
        let (reply_type, reply_payload) = dispatcher.dispatch(id, "1.2.3.4", msg).await.unwrap();
        assert_eq!(reply_type, message_type::ERROR);
        assert_eq!(reply_payload["code"], synckit_protocol::error_codes::RATE_LIMIT_EXCEEDED);
    }
}
