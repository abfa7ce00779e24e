mod common;

use axum_test::TestServer;

use murmur_gateway::gateway::lifecycle;
use murmur_gateway::gateway::presence::PresenceStatus;

use common::{test_app, test_env};

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_instance() {
    let env = test_env();
    let server = TestServer::new(test_app(&env.state)).unwrap();

    let resp = server.get("/health").await;
    resp.assert_status_ok();

    let body: serde_json::Value = resp.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["instance_id"], env.state.fanout.instance_id());
    assert!(body["instance_id"].as_str().unwrap().starts_with("inst_"));
}

// ---------------------------------------------------------------------------
// GET /api/v1/users/{user_id}/presence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_user_is_offline() {
    let env = test_env();
    let server = TestServer::new(test_app(&env.state)).unwrap();

    let resp = server.get("/api/v1/users/nobody/presence").await;
    resp.assert_status_ok();

    let body: serde_json::Value = resp.json();
    assert_eq!(body["user_id"], "nobody");
    assert_eq!(body["status"], "offline");
    assert!(body["last_active"].is_null());
    assert_eq!(body["connections"], 0);
}

#[tokio::test]
async fn connected_user_reports_connections() {
    let env = test_env();
    lifecycle::on_establish(&env.state, "sock1", "alice").await.unwrap();
    lifecycle::on_establish(&env.state, "sock2", "alice").await.unwrap();
    env.state
        .presence
        .update_and_broadcast("alice", PresenceStatus::Idle)
        .await;
    let server = TestServer::new(test_app(&env.state)).unwrap();

    let resp = server.get("/api/v1/users/alice/presence").await;
    resp.assert_status_ok();

    let body: serde_json::Value = resp.json();
    assert_eq!(body["status"], "idle");
    assert!(body["last_active"].is_string());
    assert_eq!(body["connections"], 2);
}

#[tokio::test]
async fn openapi_document_is_served() {
    let env = test_env();
    let server = TestServer::new(test_app(&env.state)).unwrap();

    let resp = server.get("/api-docs/openapi.json").await;
    resp.assert_status_ok();

    let doc: serde_json::Value = resp.json();
    assert!(doc["paths"]["/api/v1/users/{user_id}/presence"].is_object());
    assert!(doc["paths"]["/health"].is_object());
}
