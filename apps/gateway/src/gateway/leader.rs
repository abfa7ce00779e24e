//! Lease-based leader election over the shared store.
//!
//! The holder of a lease key is the leader for one singleton duty (the
//! heartbeat watcher). The lease is renewed every third of its duration and
//! expires on its own if the holder dies, so another process takes over
//! without any fixed process identity.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time;

use crate::db::kv::KeyValueStore;

pub const WATCHER_LEASE_KEY: &str = "leader:heartbeat-watcher";

pub struct LeaderLease {
    kv: Arc<dyn KeyValueStore>,
    key: String,
    owner: String,
    lease: Duration,
}

impl LeaderLease {
    pub fn new(kv: Arc<dyn KeyValueStore>, key: &str, owner: &str, lease: Duration) -> Self {
        Self {
            kv,
            key: key.to_string(),
            owner: owner.to_string(),
            lease,
        }
    }

    /// Take or extend the lease. A store error counts as not holding it.
    pub async fn try_acquire(&self) -> bool {
        match self
            .kv
            .acquire_lease(&self.key, &self.owner, self.lease.as_millis() as u64)
            .await
        {
            Ok(held) => held,
            Err(err) => {
                tracing::warn!(key = %self.key, %err, "lease renewal failed");
                false
            }
        }
    }

    /// Keep competing for the lease until `shutdown` flips to `true`,
    /// publishing leadership changes on `leader`. Releases the lease on exit.
    pub async fn run(self, leader: watch::Sender<bool>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(self.lease / 3);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let held = self.try_acquire().await;
                    leader.send_if_modified(|current| {
                        if *current == held {
                            return false;
                        }
                        *current = held;
                        if held {
                            tracing::info!(key = %self.key, owner = %self.owner, "acquired leader lease");
                        } else {
                            tracing::warn!(key = %self.key, owner = %self.owner, "lost leader lease");
                        }
                        true
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        leader.send_replace(false);
        if let Err(err) = self.kv.release_lease(&self.key, &self.owner).await {
            tracing::warn!(key = %self.key, %err, "failed to release leader lease");
        }
    }
}
