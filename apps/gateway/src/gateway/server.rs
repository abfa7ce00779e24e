//! WebSocket upgrade handler and per-connection event loop.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use murmur_common::id::{prefix, prefixed_ulid};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time;

use crate::auth::tickets::consume_ws_ticket;
use crate::AppState;

use super::events::{
    AckPayload, ClientMessage, ClientRequest, EventName, GatewayMessage, IdentifyPayload,
    OP_HEARTBEAT, OP_IDENTIFY, OP_REQUEST,
};
use super::fanout::BroadcastPayload;
use super::handler::handle_request;
use super::lifecycle::{self, Established};
use super::session::GatewaySession;

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Close codes (4000-range for application-level).
const CLOSE_UNKNOWN_ERROR: u16 = 4000;
const CLOSE_UNKNOWN_OPCODE: u16 = 4001;
const CLOSE_NOT_AUTHENTICATED: u16 = 4003;
const CLOSE_AUTH_FAILED: u16 = 4004;
const CLOSE_SESSION_TIMEOUT: u16 = 4009;

/// Timeout for receiving IDENTIFY after connection (seconds).
const IDENTIFY_TIMEOUT_SECS: u64 = 10;

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Step 1: Wait for IDENTIFY within timeout.
    let identify = time::timeout(Duration::from_secs(IDENTIFY_TIMEOUT_SECS), async {
        while let Some(msg) = ws_rx.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!(?e, "ws read error during identify");
                    return Err("read error");
                }
            };

            let text = match msg {
                Message::Text(t) => t,
                Message::Close(_) => return Err("client closed"),
                _ => continue,
            };

            let client_msg: ClientMessage =
                serde_json::from_str(&text).map_err(|_| "Invalid JSON")?;

            if client_msg.op != OP_IDENTIFY {
                let _ = send_close(&mut ws_tx, CLOSE_NOT_AUTHENTICATED, "Expected IDENTIFY").await;
                return Err("expected identify");
            }
            return serde_json::from_value::<IdentifyPayload>(client_msg.d)
                .map_err(|_| "invalid identify payload");
        }
        Err("connection closed before identify")
    })
    .await;

    let payload = match identify {
        Ok(Ok(payload)) => payload,
        Ok(Err(reason)) => {
            tracing::debug!(%reason, "initial handshake failed");
            let _ = send_close(&mut ws_tx, CLOSE_AUTH_FAILED, reason).await;
            return;
        }
        Err(_timeout) => {
            let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Handshake timeout").await;
            return;
        }
    };

    // Step 2: Resolve the ticket to a user.
    let user_id = match consume_ws_ticket(state.kv.as_ref(), &payload.ticket).await {
        Ok(Some(data)) => data.user_id,
        Ok(None) => {
            let _ = send_close(&mut ws_tx, CLOSE_AUTH_FAILED, "Invalid or expired ticket").await;
            return;
        }
        Err(err) => {
            tracing::warn!(%err, "ticket lookup failed");
            let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Ticket lookup failed").await;
            return;
        }
    };

    // Subscribe before joining rooms so nothing emitted meanwhile is missed.
    let broadcast_rx = state.broadcast.subscribe();
    let connection_id = prefixed_ulid(prefix::CONNECTION);

    // Step 3: Bring the connection online.
    let Established {
        session,
        chats,
        friends,
    } = match lifecycle::on_establish(&state, &connection_id, &user_id).await {
        Ok(established) => established,
        Err(err) => {
            tracing::warn!(%user_id, %err, "connection setup failed");
            let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Connection setup failed").await;
            // The connection may already be registered; let the grace path clean it up.
            lifecycle::on_disconnect(&state, &user_id, &connection_id);
            return;
        }
    };
    let session = Arc::new(session);

    tracing::info!(
        connection_id = %session.connection_id,
        user_id = %session.user_id,
        chats = chats.len(),
        "gateway session established"
    );

    let ready = GatewayMessage::dispatch(
        EventName::READY,
        session.next_seq(),
        json!({
            "connection_id": session.connection_id,
            "user_id": session.user_id,
            "heartbeat_interval": state.config.heartbeat_interval_ms(),
            "chats": chats,
        }),
    );
    let friends_status = GatewayMessage::dispatch(
        EventName::FRIENDS_STATUS,
        session.next_seq(),
        json!({ "friends": friends }),
    );

    if send_message(&mut ws_tx, &ready).await.is_ok()
        && send_message(&mut ws_tx, &friends_status).await.is_ok()
    {
        run_session(&state, session.clone(), ws_tx, ws_rx, broadcast_rx).await;
    }

    lifecycle::on_disconnect(&state, &session.user_id, &session.connection_id);

    tracing::info!(
        connection_id = %session.connection_id,
        user_id = %session.user_id,
        "gateway session ended"
    );
}

/// Main session event loop: read client messages, forward broadcasts, enforce heartbeat.
async fn run_session(
    state: &AppState,
    session: Arc<GatewaySession>,
    mut ws_tx: WsSink,
    mut ws_rx: WsStream,
    mut broadcast_rx: broadcast::Receiver<Arc<BroadcastPayload>>,
) {
    // Heartbeat deadline: client must heartbeat within 1.5× the interval.
    let heartbeat_deadline = Duration::from_millis(state.config.heartbeat_interval_ms() * 3 / 2);
    let mut heartbeat_timer = time::interval(heartbeat_deadline);
    heartbeat_timer.tick().await; // First tick fires immediately; skip it.
    let mut got_heartbeat = true;

    loop {
        tokio::select! {
            // Client sends us a message.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let client_msg: ClientMessage = match serde_json::from_str(&text) {
                            Ok(m) => m,
                            Err(_) => {
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Invalid JSON").await;
                                break;
                            }
                        };

                        match client_msg.op {
                            OP_HEARTBEAT => {
                                got_heartbeat = true;
                                lifecycle::on_heartbeat(state, &session).await;
                                if send_message(&mut ws_tx, &GatewayMessage::heartbeat_ack()).await.is_err() {
                                    break;
                                }
                            }
                            OP_REQUEST => {
                                let ack = match ClientRequest::parse(client_msg.t.as_deref(), client_msg.d) {
                                    Ok(request) => {
                                        handle_request(state, &session, client_msg.nonce, request).await
                                    }
                                    Err(err) => AckPayload::error(client_msg.nonce, &err),
                                };
                                if send_message(&mut ws_tx, &GatewayMessage::ack(ack)).await.is_err() {
                                    break;
                                }
                            }
                            OP_IDENTIFY => {
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Already identified").await;
                                break;
                            }
                            _ => {
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_OPCODE, "Unknown opcode").await;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, connection_id = %session.connection_id, "ws read error");
                        break;
                    }
                    _ => continue,
                }
            }

            // Broadcast event from the fanout hub.
            result = broadcast_rx.recv() => {
                match result {
                    Ok(payload) => {
                        if !session.is_subscribed(&payload.room) {
                            continue;
                        }

                        let msg = GatewayMessage::dispatch(
                            &payload.event_name,
                            session.next_seq(),
                            payload.data.clone(),
                        );
                        if send_message(&mut ws_tx, &msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(
                            connection_id = %session.connection_id,
                            skipped = n,
                            "gateway session lagged behind broadcast"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = heartbeat_timer.tick() => {
                if !got_heartbeat {
                    tracing::debug!(
                        connection_id = %session.connection_id,
                        "heartbeat timeout, closing connection"
                    );
                    let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Heartbeat timeout").await;
                    break;
                }
                got_heartbeat = false;
            }
        }
    }
}

async fn send_message(ws_tx: &mut WsSink, msg: &GatewayMessage) -> Result<(), axum::Error> {
    let json = serde_json::to_string(msg).map_err(axum::Error::new)?;
    ws_tx.send(Message::Text(json.into())).await
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &str) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
