pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod models;
pub mod relay;
pub mod routes;
pub mod store;

use std::sync::Arc;

use config::Config;
use db::kv::KeyValueStore;
use gateway::delivery::DeliveryTracker;
use gateway::fanout::{Fanout, GatewayBroadcast};
use gateway::presence::PresenceService;
use gateway::registry::OnlineRegistry;
use murmur_common::id::{prefix, prefixed_ulid};
use murmur_common::SnowflakeGenerator;
use relay::RelayProducer;
use store::{ChatDirectory, MessageRepository, NotificationRepository};

/// External systems the gateway talks to.
pub struct Backends {
    pub kv: Arc<dyn KeyValueStore>,
    pub directory: Arc<dyn ChatDirectory>,
    pub messages: Arc<dyn MessageRepository>,
    pub notifications: Arc<dyn NotificationRepository>,
    pub relay: Arc<dyn RelayProducer>,
}

/// Shared application state available to all route handlers and sessions.
#[derive(Clone)]
pub struct AppState {
    pub kv: Arc<dyn KeyValueStore>,
    pub directory: Arc<dyn ChatDirectory>,
    pub messages: Arc<dyn MessageRepository>,
    pub notifications: Arc<dyn NotificationRepository>,
    pub relay: Arc<dyn RelayProducer>,
    pub config: Arc<Config>,
    pub snowflake: Arc<SnowflakeGenerator>,
    pub broadcast: GatewayBroadcast,
    pub fanout: Arc<Fanout>,
    pub registry: OnlineRegistry,
    pub presence: PresenceService,
    pub delivery: DeliveryTracker,
}

impl AppState {
    /// Wire the gateway services over `backends`. Each state gets a fresh
    /// instance id, used to tag cross-instance fan-out and own the leader lease.
    pub fn new(config: Config, backends: Backends) -> Self {
        let Backends {
            kv,
            directory,
            messages,
            notifications,
            relay,
        } = backends;

        let instance_id = prefixed_ulid(prefix::INSTANCE);
        let broadcast = GatewayBroadcast::new();
        let fanout = Arc::new(Fanout::bridged(broadcast.clone(), Arc::clone(&kv), &instance_id));
        let registry = OnlineRegistry::new(Arc::clone(&kv));
        let presence = PresenceService::new(Arc::clone(&kv), Arc::clone(&directory), Arc::clone(&fanout));
        let delivery = DeliveryTracker::new(
            Arc::clone(&kv),
            Arc::clone(&directory),
            Arc::clone(&messages),
            Arc::clone(&fanout),
        );
        let snowflake = Arc::new(SnowflakeGenerator::new(config.worker_id));

        Self {
            kv,
            directory,
            messages,
            notifications,
            relay,
            config: Arc::new(config),
            snowflake,
            broadcast,
            fanout,
            registry,
            presence,
            delivery,
        }
    }
}
