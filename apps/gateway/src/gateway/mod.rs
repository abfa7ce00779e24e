//! Realtime gateway: connection sessions, presence, delivery tracking and
//! room fan-out.

pub mod delivery;
pub mod events;
pub mod fanout;
pub mod handler;
pub mod heartbeat;
pub mod leader;
pub mod lifecycle;
pub mod presence;
pub mod registry;
pub mod rooms;
pub mod server;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::ApiError;
use crate::relay::{self, RelaySource};
use crate::AppState;

use heartbeat::HeartbeatWatcher;
use leader::{LeaderLease, WATCHER_LEASE_KEY};

/// Start the per-process background tasks: the cross-instance fan-out
/// listener, the relay consumer and, when enabled, the leader lease with
/// the heartbeat watcher it gates. All tasks stop when `shutdown` flips.
pub async fn start_background_tasks(
    state: &AppState,
    source: Box<dyn RelaySource>,
    shutdown: watch::Receiver<bool>,
) -> Result<Vec<JoinHandle<()>>, ApiError> {
    let mut tasks = Vec::new();

    if let Some(listener) = state.fanout.listen(shutdown.clone()).await? {
        tasks.push(listener);
    }

    tasks.push(tokio::spawn(relay::run_consumer(
        state.clone(),
        source,
        shutdown.clone(),
    )));

    if state.config.heartbeat_watcher {
        let lease = LeaderLease::new(
            Arc::clone(&state.kv),
            WATCHER_LEASE_KEY,
            state.fanout.instance_id(),
            Duration::from_millis(state.config.leader_lease_ms),
        );
        let (leader_tx, leader_rx) = watch::channel(false);
        tasks.push(tokio::spawn(lease.run(leader_tx, shutdown)));

        let watcher = HeartbeatWatcher::new(state.registry.clone(), state.presence.clone());
        tasks.push(tokio::spawn(watcher.run(
            Arc::clone(&state.kv),
            state.config.expiry_channel(),
            leader_rx,
        )));
    } else {
        tracing::info!("heartbeat watcher disabled on this instance");
    }

    Ok(tasks)
}
