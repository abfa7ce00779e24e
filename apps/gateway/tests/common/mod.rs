#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::sync::broadcast;

use murmur_gateway::config::Config;
use murmur_gateway::db::kv::{KeyValueStore, MemoryStore};
use murmur_gateway::gateway::fanout::BroadcastPayload;
use murmur_gateway::gateway::rooms::Room;
use murmur_gateway::relay::memory::{MemoryBroker, MemoryRelaySource};
use murmur_gateway::store::MemoryRecords;
use murmur_gateway::{AppState, Backends};

pub fn test_config() -> Config {
    Config {
        database_url: String::new(),
        redis_url: "redis://localhost:6379/0".to_string(),
        kafka_brokers: None,
        kafka_topic: "chat-messages".to_string(),
        kafka_group_id: "murmur-relay".to_string(),
        heartbeat_ttl_secs: 45,
        disconnect_grace_secs: 5,
        heartbeat_watcher: true,
        leader_lease_ms: 15_000,
        worker_id: 1,
        port: 0,
    }
}

/// A gateway instance over in-memory backends.
pub struct TestEnv {
    pub state: AppState,
    pub kv: Arc<MemoryStore>,
    pub records: Arc<MemoryRecords>,
    pub broker: Arc<MemoryBroker>,
    pub source: Option<MemoryRelaySource>,
}

impl TestEnv {
    /// Take the relay consumer end; only one consumer may run per broker.
    pub fn take_source(&mut self) -> MemoryRelaySource {
        self.source.take().expect("relay source already taken")
    }
}

pub fn test_env() -> TestEnv {
    test_env_sharing(
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryRecords::new()),
        test_config(),
    )
}

/// Another instance over the same shared store and records, as a second
/// gateway process would see them.
pub fn test_env_sharing(kv: Arc<MemoryStore>, records: Arc<MemoryRecords>, config: Config) -> TestEnv {
    let (broker, source) = MemoryBroker::new(&config.kafka_topic);
    let broker = Arc::new(broker);
    let state = AppState::new(
        config,
        Backends {
            kv: kv.clone() as Arc<dyn KeyValueStore>,
            directory: records.clone(),
            messages: records.clone(),
            notifications: records.clone(),
            relay: broker.clone(),
        },
    );
    TestEnv {
        state,
        kv,
        records,
        broker,
        source: Some(source),
    }
}

pub fn test_app(state: &AppState) -> Router {
    murmur_gateway::routes::router().with_state(state.clone())
}

/// Everything currently queued on a broadcast receiver.
pub fn drain(rx: &mut broadcast::Receiver<Arc<BroadcastPayload>>) -> Vec<Arc<BroadcastPayload>> {
    let mut out = Vec::new();
    while let Ok(payload) = rx.try_recv() {
        out.push(payload);
    }
    out
}

/// Queued events with the given name, as `(room, data)` pairs.
pub fn events_named(
    rx: &mut broadcast::Receiver<Arc<BroadcastPayload>>,
    name: &str,
) -> Vec<(Room, serde_json::Value)> {
    drain(rx)
        .into_iter()
        .filter(|p| p.event_name == name)
        .map(|p| (p.room.clone(), p.data.clone()))
        .collect()
}

/// Wait for the next event with the given name, up to five seconds.
pub async fn next_event(
    rx: &mut broadcast::Receiver<Arc<BroadcastPayload>>,
    name: &str,
) -> Arc<BroadcastPayload> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let payload = rx.recv().await.expect("broadcast closed");
            if payload.event_name == name {
                return payload;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {name}"))
}

/// Poll `check` until it holds, up to five seconds.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
