//! Heartbeat keys and the expiry watcher that demotes silent users to idle.
//!
//! Every heartbeat renews `heartbeat:<user>` with a TTL. When the key
//! expires the store announces it on its expiry channel; if the user still
//! has open connections they went quiet without disconnecting, so their
//! presence drops to `Idle`. Only the leader-lease holder processes these
//! events, otherwise each gateway instance would broadcast the demotion.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;

use crate::db::kv::KeyValueStore;
use crate::error::ApiError;

use super::presence::{PresenceService, PresenceStatus};
use super::registry::OnlineRegistry;

pub const HEARTBEAT_PREFIX: &str = "heartbeat:";

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

pub fn heartbeat_key(user_id: &str) -> String {
    format!("{HEARTBEAT_PREFIX}{user_id}")
}

/// Owning user of an expired heartbeat key; `None` for any other key.
pub fn user_from_expired_key(key: &str) -> Option<&str> {
    key.strip_prefix(HEARTBEAT_PREFIX).filter(|id| !id.is_empty())
}

pub async fn renew_heartbeat(
    kv: &dyn KeyValueStore,
    user_id: &str,
    ttl_secs: u64,
) -> Result<(), ApiError> {
    kv.set_ex(&heartbeat_key(user_id), "1", ttl_secs).await
}

#[derive(Clone)]
pub struct HeartbeatWatcher {
    registry: OnlineRegistry,
    presence: PresenceService,
}

impl HeartbeatWatcher {
    pub fn new(registry: OnlineRegistry, presence: PresenceService) -> Self {
        Self { registry, presence }
    }

    /// Handle one expired key. Returns whether the user was demoted.
    pub async fn handle_expired(&self, key: &str) -> bool {
        let Some(user_id) = user_from_expired_key(key) else {
            return false;
        };

        let open = match self.registry.count_connections(user_id).await {
            Ok(n) => n,
            Err(err) => {
                tracing::warn!(%user_id, %err, "connection count failed on heartbeat expiry");
                return false;
            }
        };
        // Fully disconnected users were already handled by the disconnect path.
        if open == 0 {
            return false;
        }

        self.presence
            .update_and_broadcast(user_id, PresenceStatus::Idle)
            .await
    }

    /// Process expiry events from `channel` while `leader` reads `true`.
    /// The subscription is dropped whenever leadership is lost.
    pub async fn run(
        self,
        kv: Arc<dyn KeyValueStore>,
        channel: String,
        mut leader: watch::Receiver<bool>,
    ) {
        loop {
            if leader.wait_for(|held| *held).await.is_err() {
                return;
            }

            let mut events = match kv.subscribe(std::slice::from_ref(&channel)).await {
                Ok(events) => events,
                Err(err) => {
                    tracing::warn!(%channel, %err, "expiry subscription failed");
                    tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                    continue;
                }
            };
            tracing::info!(%channel, "heartbeat watcher active");

            loop {
                tokio::select! {
                    changed = leader.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if !*leader.borrow() {
                            tracing::info!("heartbeat watcher paused, lease not held");
                            break;
                        }
                    }
                    event = events.next() => match event {
                        Some(message) => {
                            if self.handle_expired(&message.payload).await {
                                tracing::debug!(key = %message.payload, "demoted idle user");
                            }
                        }
                        None => {
                            tracing::warn!(%channel, "expiry subscription ended");
                            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                            break;
                        }
                    }
                }
            }
        }
    }
}
