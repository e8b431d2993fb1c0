use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use serde_json::json;
use synckit_protocol::{decode_message, encode_message, message_type};
use tracing::{info, warn};

use crate::state::ServerContext;

/// Upgrades an HTTP connection to a websocket and hands it to the
/// per-connection loop, grounded on `ws_forwarder.rs`'s
/// `ws_forwarder_handler`/`handle_forwarder_socket` split.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<ServerContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let ip = addr.ip().to_string();
    ws.on_upgrade(move |socket| handle_socket(socket, ctx, ip))
}

async fn handle_socket(mut socket: WebSocket, ctx: Arc<ServerContext>, ip: String) {
    if !ctx.security.connections.try_admit(&ip).await {
        let frame = encode_message(
            message_type::ERROR,
            &json!({ "code": synckit_protocol::error_codes::RATE_LIMIT_EXCEEDED, "message": "too many connections from this address" }),
            now_ms(),
        );
        let _ = socket.send(Message::Binary(frame.into())).await;
        return;
    }

    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel();
    let connection_id = ctx.hub.register(ip.clone(), outbound_tx).await;
    info!(%connection_id, %ip, "connection established");

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        if !handle_frame(&mut socket, &ctx, connection_id, &ip, &data).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        if !handle_frame(&mut socket, &ctx, connection_id, &ip, text.as_bytes()).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        info!(%connection_id, "connection closed by peer");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(%connection_id, error = %e, "websocket transport error");
                        break;
                    }
                }
            }
            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(frame) => {
                        let bytes = encode_message(frame.type_name, &frame.payload, frame.timestamp);
                        if socket.send(Message::Binary(bytes.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    ctx.security.connections.release(&ip).await;
    ctx.hub.unregister(connection_id).await;
    info!(%connection_id, "connection torn down");
}

/// Decodes one frame and runs it through the dispatcher. Framing failures
/// are transport-fatal (§7): the connection is closed rather than
/// answered with a per-message error. Returns `false` when the caller
/// should stop reading from this socket.
async fn handle_frame(
    socket: &mut WebSocket,
    ctx: &Arc<ServerContext>,
    connection_id: uuid::Uuid,
    ip: &str,
    data: &[u8],
) -> bool {
    let decoded = match decode_message(data) {
        Ok(d) => d,
        Err(e) => {
            warn!(%connection_id, error = %e, "malformed frame, closing connection");
            let frame = encode_message(
                message_type::ERROR,
                &json!({ "code": synckit_protocol::error_codes::INVALID_MESSAGE, "message": e.to_string() }),
                now_ms(),
            );
            let _ = socket.send(Message::Binary(frame.into())).await;
            return false;
        }
    };

    if let Some((type_name, payload)) = ctx.dispatcher.dispatch(connection_id, ip, decoded).await {
        let bytes = encode_message(type_name, &payload, now_ms());
        if socket.send(Message::Binary(bytes.into())).await.is_err() {
            return false;
        }
    }
    true
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
