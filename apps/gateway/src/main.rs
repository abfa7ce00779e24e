use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use murmur_gateway::config::Config;
use murmur_gateway::db::kv::KeyValueStore;
use murmur_gateway::db::pool::{self, DEFAULT_POOL_SIZE};
use murmur_gateway::db::redis_store::RedisStore;
use murmur_gateway::gateway;
use murmur_gateway::relay::kafka::{KafkaRelayProducer, KafkaRelaySource};
use murmur_gateway::relay::memory::MemoryBroker;
use murmur_gateway::relay::{RelayProducer, RelaySource};
use murmur_gateway::store::PgStore;
use murmur_gateway::{AppState, Backends};

/// How long background tasks get to wind down (lease release, last commit).
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing; env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    let db = pool::connect(&config.database_url, DEFAULT_POOL_SIZE)
        .expect("failed to create database pool");
    let pg = Arc::new(PgStore::new(db));

    let redis = RedisStore::connect(&config.redis_url)
        .await
        .expect("failed to connect to redis");
    redis.enable_expiry_notifications().await;
    let kv: Arc<dyn KeyValueStore> = Arc::new(redis);

    let (relay, source): (Arc<dyn RelayProducer>, Box<dyn RelaySource>) =
        match &config.kafka_brokers {
            Some(brokers) => (
                Arc::new(
                    KafkaRelayProducer::new(brokers, &config.kafka_topic)
                        .expect("failed to create kafka producer"),
                ),
                Box::new(
                    KafkaRelaySource::new(brokers, &config.kafka_group_id, &config.kafka_topic)
                        .expect("failed to create kafka consumer"),
                ),
            ),
            None => {
                tracing::warn!("KAFKA_BROKERS not set, relaying messages in-process only");
                let (broker, source) = MemoryBroker::new(&config.kafka_topic);
                (Arc::new(broker), Box::new(source))
            }
        };

    tracing::info!(
        worker_id = config.worker_id,
        heartbeat_ttl_secs = config.heartbeat_ttl_secs,
        disconnect_grace_secs = config.disconnect_grace_secs,
        heartbeat_watcher = config.heartbeat_watcher,
        "gateway configured"
    );

    let state = AppState::new(
        config,
        Backends {
            kv,
            directory: pg.clone(),
            messages: pg.clone(),
            notifications: pg,
            relay,
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = gateway::start_background_tasks(&state, source, shutdown_rx)
        .await
        .expect("failed to start background tasks");

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(murmur_gateway::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, instance_id = %state.fanout.instance_id(), "gateway listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    tracing::info!("shutting down background tasks");
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(SHUTDOWN_GRACE, futures_util::future::join_all(tasks))
        .await
        .is_err()
    {
        tracing::warn!("background tasks did not stop in time");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(?err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(?err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
