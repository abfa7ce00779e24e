mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use murmur_gateway::auth::tickets::issue_ws_ticket;
use murmur_gateway::db::kv::MemoryStore;
use murmur_gateway::gateway::presence::PresenceStatus;
use murmur_gateway::gateway::start_background_tasks;
use murmur_gateway::store::MemoryRecords;
use murmur_gateway::AppState;

use common::{test_app, test_config, test_env, test_env_sharing, TestEnv};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Helper: start an actual TCP server for WebSocket testing.
async fn start_ws_server(state: &AppState) -> SocketAddr {
    let app = test_app(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

/// Helper: start the relay consumer and fan-out listener for `env`.
async fn start_tasks(env: &mut TestEnv) -> watch::Sender<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let source = Box::new(env.take_source());
    start_background_tasks(&env.state, source, shutdown_rx)
        .await
        .expect("background tasks");
    shutdown_tx
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(tungstenite::Message::Text(value.to_string().into()))
        .await
        .expect("ws send");
}

/// Next frame from the server, text or close.
async fn next_frame(ws: &mut Ws) -> tungstenite::Message {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for frame")
            .expect("stream ended")
            .expect("ws read error");
        match msg {
            tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => continue,
            other => return other,
        }
    }
}

async fn next_json(ws: &mut Ws) -> Value {
    let text = next_frame(ws).await.into_text().expect("not text");
    serde_json::from_str(&text).expect("parse frame")
}

/// Read frames until one matches `pred`, discarding the rest.
async fn next_matching(ws: &mut Ws, pred: impl Fn(&Value) -> bool) -> Value {
    loop {
        let frame = next_json(ws).await;
        if pred(&frame) {
            return frame;
        }
    }
}

async fn next_dispatch(ws: &mut Ws, event: &str) -> Value {
    next_matching(ws, |f| f["op"] == 0 && f["t"] == event).await
}

async fn expect_close(ws: &mut Ws, code: u16) {
    match next_frame(ws).await {
        tungstenite::Message::Close(Some(frame)) => {
            assert_eq!(
                frame.code,
                tungstenite::protocol::frame::coding::CloseCode::from(code)
            );
        }
        other => panic!("Expected Close frame, got: {other:?}"),
    }
}

async fn connect(addr: SocketAddr) -> Ws {
    let url = format!("ws://{addr}/gateway");
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");
    ws
}

/// Helper: connect, IDENTIFY with a fresh ticket, and consume READY and
/// FRIENDS_STATUS. Returns the socket and the READY frame.
async fn connect_as(addr: SocketAddr, state: &AppState, user_id: &str) -> (Ws, Value) {
    let ticket = issue_ws_ticket(state.kv.as_ref(), user_id)
        .await
        .expect("issue ticket");
    let mut ws = connect(addr).await;
    send_json(&mut ws, json!({ "op": 2, "d": { "ticket": ticket } })).await;

    let ready = next_json(&mut ws).await;
    assert_eq!(ready["op"], 0, "READY should be op=0 (DISPATCH)");
    assert_eq!(ready["t"], "READY");
    let friends = next_json(&mut ws).await;
    assert_eq!(friends["t"], "FRIENDS_STATUS");

    (ws, ready)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn gateway_identify_returns_ready_then_friends() {
    let env = test_env();
    env.records.add_chat("c1", &["alice", "bob"]);
    env.records.add_friendship("alice", "bob");
    env.state
        .presence
        .update_and_broadcast("bob", PresenceStatus::Idle)
        .await;
    let addr = start_ws_server(&env.state).await;

    let ticket = issue_ws_ticket(env.state.kv.as_ref(), "alice").await.unwrap();
    let mut ws = connect(addr).await;
    send_json(&mut ws, json!({ "op": 2, "d": { "ticket": ticket } })).await;

    let ready = next_json(&mut ws).await;
    assert_eq!(ready["t"], "READY");
    assert_eq!(ready["s"], 1);
    let d = &ready["d"];
    assert!(d["connection_id"].as_str().unwrap().starts_with("conn_"));
    assert_eq!(d["user_id"], "alice");
    assert_eq!(d["heartbeat_interval"], 30_000);
    assert_eq!(d["chats"], json!(["c1"]));

    let friends = next_json(&mut ws).await;
    assert_eq!(friends["t"], "FRIENDS_STATUS");
    assert_eq!(friends["s"], 2);
    assert_eq!(friends["d"]["friends"][0]["user_id"], "bob");
    assert_eq!(friends["d"]["friends"][0]["status"], "idle");

    assert_eq!(
        env.state.presence.get_status("alice").await.unwrap().status,
        PresenceStatus::Online
    );
}

#[tokio::test]
async fn gateway_rejects_invalid_ticket() {
    let env = test_env();
    let addr = start_ws_server(&env.state).await;

    let mut ws = connect(addr).await;
    send_json(&mut ws, json!({ "op": 2, "d": { "ticket": "wst_bogus" } })).await;

    expect_close(&mut ws, 4004).await;
}

#[tokio::test]
async fn gateway_ticket_is_single_use() {
    let env = test_env();
    let addr = start_ws_server(&env.state).await;
    let ticket = issue_ws_ticket(env.state.kv.as_ref(), "alice").await.unwrap();

    let mut first = connect(addr).await;
    send_json(&mut first, json!({ "op": 2, "d": { "ticket": ticket } })).await;
    assert_eq!(next_json(&mut first).await["t"], "READY");

    let mut second = connect(addr).await;
    send_json(&mut second, json!({ "op": 2, "d": { "ticket": ticket } })).await;
    expect_close(&mut second, 4004).await;
}

#[tokio::test]
async fn gateway_requires_identify_first() {
    let env = test_env();
    let addr = start_ws_server(&env.state).await;

    let mut ws = connect(addr).await;
    send_json(&mut ws, json!({ "op": 1 })).await;

    expect_close(&mut ws, 4003).await;
}

#[tokio::test]
async fn gateway_heartbeat_returns_ack() {
    let env = test_env();
    let addr = start_ws_server(&env.state).await;
    let (mut ws, _) = connect_as(addr, &env.state, "alice").await;

    send_json(&mut ws, json!({ "op": 1 })).await;

    let ack = next_json(&mut ws).await;
    assert_eq!(ack["op"], 6, "HEARTBEAT_ACK should be op=6");
}

#[tokio::test]
async fn gateway_unknown_opcode_closes_connection() {
    let env = test_env();
    let addr = start_ws_server(&env.state).await;
    let (mut ws, _) = connect_as(addr, &env.state, "alice").await;

    send_json(&mut ws, json!({ "op": 99 })).await;

    expect_close(&mut ws, 4001).await;
}

#[tokio::test]
async fn gateway_bad_request_gets_error_ack_with_nonce() {
    let env = test_env();
    env.records.add_chat("c1", &["bob"]);
    let addr = start_ws_server(&env.state).await;
    let (mut ws, _) = connect_as(addr, &env.state, "alice").await;

    send_json(&mut ws, json!({ "op": 4, "t": "NOPE", "d": {}, "nonce": "n-1" })).await;
    let ack = next_json(&mut ws).await;
    assert_eq!(ack["op"], 5);
    assert_eq!(ack["d"]["nonce"], "n-1");
    assert_eq!(ack["d"]["status"], "error");
    assert_eq!(ack["d"]["status_code"], 400);

    send_json(
        &mut ws,
        json!({ "op": 4, "t": "JOIN_CHAT", "d": { "chat_id": "c1" }, "nonce": "n-2" }),
    )
    .await;
    let ack = next_json(&mut ws).await;
    assert_eq!(ack["d"]["nonce"], "n-2");
    assert_eq!(ack["d"]["status_code"], 403);
}

#[tokio::test]
async fn gateway_relays_message_to_other_members() {
    let mut env = test_env();
    env.records.add_user("alice", "Alice");
    env.records.add_chat("c1", &["alice", "bob"]);
    let _shutdown = start_tasks(&mut env).await;
    let addr = start_ws_server(&env.state).await;

    let (mut alice, _) = connect_as(addr, &env.state, "alice").await;
    let (mut bob, _) = connect_as(addr, &env.state, "bob").await;

    send_json(
        &mut alice,
        json!({
            "op": 4,
            "t": "SEND_MESSAGE",
            "d": { "chat_id": "c1", "content": "hi bob", "client_id": "cl-1" },
            "nonce": "n-send",
        }),
    )
    .await;
    let ack = next_matching(&mut alice, |f| f["op"] == 5).await;
    assert_eq!(ack["d"]["status"], "ok");
    assert_eq!(ack["d"]["nonce"], "n-send");

    let created = next_dispatch(&mut bob, "MESSAGE_CREATE").await;
    let d = &created["d"];
    assert_eq!(d["chat_id"], "c1");
    assert_eq!(d["sender_id"], "alice");
    assert_eq!(d["content"], "hi bob");
    assert_eq!(d["status"], "sent");
    assert_eq!(d["sender"]["display_name"], "Alice");
    let message_id = d["id"].as_str().unwrap().to_string();

    // Bob reads the chat; only Alice hears about it.
    send_json(
        &mut bob,
        json!({ "op": 4, "t": "MARK_SEEN", "d": { "chat_id": "c1" }, "nonce": "n-seen" }),
    )
    .await;
    let seen_ack = next_matching(&mut bob, |f| f["op"] == 5).await;
    assert_eq!(seen_ack["d"]["data"]["count"], 1);

    let update = next_dispatch(&mut alice, "MESSAGE_STATUS_UPDATE").await;
    assert_eq!(update["d"]["user_id"], "bob");
    assert_eq!(update["d"]["status"], "seen");
    assert_eq!(update["d"]["messages"][0]["id"], message_id.as_str());
    assert_eq!(update["d"]["messages"][0]["status"], "seen");
}

#[tokio::test]
async fn gateway_sequence_numbers_increase() {
    let env = test_env();
    env.records.add_chat("c1", &["alice", "bob"]);
    let addr = start_ws_server(&env.state).await;
    let (mut alice, ready) = connect_as(addr, &env.state, "alice").await;
    assert_eq!(ready["s"], 1);

    // Alice's own online update reaches her through the shared chat.
    let own = next_dispatch(&mut alice, "STATUS_UPDATE").await;
    assert_eq!(own["d"]["user_id"], "alice");
    assert_eq!(own["s"], 3);

    let (_bob, _) = connect_as(addr, &env.state, "bob").await;
    let update = next_dispatch(&mut alice, "STATUS_UPDATE").await;
    assert_eq!(update["d"]["user_id"], "bob");
    assert_eq!(update["d"]["status"], "online");
    assert_eq!(update["s"], 4);
}

#[tokio::test]
async fn gateway_close_goes_offline_after_grace() {
    let mut config = test_config();
    config.disconnect_grace_secs = 0;
    let env = test_env_sharing(Arc::new(MemoryStore::new()), Arc::new(MemoryRecords::new()), config);
    let addr = start_ws_server(&env.state).await;
    let (mut ws, _) = connect_as(addr, &env.state, "alice").await;

    ws.close(None).await.expect("close");

    let presence = env.state.presence.clone();
    time::timeout(Duration::from_secs(5), async move {
        loop {
            let status = presence.get_status("alice").await.unwrap().status;
            if status == PresenceStatus::Offline {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("alice never went offline");
    assert_eq!(env.state.registry.count_connections("alice").await.unwrap(), 0);
}
