//! Broadcast hub for dispatching gateway events to connected sessions.
//!
//! Locally a single `tokio::sync::broadcast` channel carries every event;
//! each session subscribes once and filters by the rooms it has joined.
//! Across processes the same events travel over a pub/sub channel in the
//! shared store, so a room spans every gateway instance.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::db::kv::{KeyValueStore, PubSubMessage};
use crate::error::ApiError;

use super::rooms::Room;

/// Capacity of the broadcast channel. Slow receivers that fall behind will
/// skip messages (RecvError::Lagged).
const BROADCAST_CAPACITY: usize = 4096;

/// Shared-store channel bridging gateway processes.
pub const FANOUT_CHANNEL: &str = "gateway:fanout";

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// A payload broadcast to all connected gateway sessions.
#[derive(Debug, Clone)]
pub struct BroadcastPayload {
    /// Room the event is addressed to.
    pub room: Room,
    /// The dispatch event name (e.g. "MESSAGE_CREATE").
    pub event_name: String,
    pub data: Value,
}

/// The per-process broadcast hub. Cloneable.
#[derive(Clone)]
pub struct GatewayBroadcast {
    sender: broadcast::Sender<Arc<BroadcastPayload>>,
}

impl GatewayBroadcast {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { sender }
    }

    /// Each gateway session calls this once to get its own receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<BroadcastPayload>> {
        self.sender.subscribe()
    }

    pub fn dispatch(&self, payload: BroadcastPayload) {
        // send() returns Err if there are no receivers, that's fine.
        let _ = self.sender.send(Arc::new(payload));
    }
}

impl Default for GatewayBroadcast {
    fn default() -> Self {
        Self::new()
    }
}

/// Wire form of an event on the shared channel.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    origin: String,
    room: Room,
    t: String,
    d: Value,
}

/// Room-addressed emitter used by every component that produces events.
pub struct Fanout {
    local: GatewayBroadcast,
    bus: Option<Arc<dyn KeyValueStore>>,
    instance_id: String,
}

impl Fanout {
    /// Dispatch only within this process.
    pub fn local(local: GatewayBroadcast) -> Self {
        Self {
            local,
            bus: None,
            instance_id: String::new(),
        }
    }

    /// Dispatch locally and relay to the other instances through `bus`.
    pub fn bridged(local: GatewayBroadcast, bus: Arc<dyn KeyValueStore>, instance_id: &str) -> Self {
        Self {
            local,
            bus: Some(bus),
            instance_id: instance_id.to_string(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Send `event_name` to every connection in `room`, on every instance.
    ///
    /// Local delivery always happens; a failed publish is logged and the
    /// remote instances miss the event.
    pub async fn emit(&self, room: Room, event_name: &str, data: Value) {
        if let Some(bus) = &self.bus {
            let envelope = Envelope {
                origin: self.instance_id.clone(),
                room: room.clone(),
                t: event_name.to_string(),
                d: data.clone(),
            };
            match serde_json::to_string(&envelope) {
                Ok(json) => {
                    if let Err(err) = bus.publish(FANOUT_CHANNEL, &json).await {
                        tracing::warn!(%err, %room, event = event_name, "fan-out publish failed");
                    }
                }
                Err(err) => tracing::error!(?err, "fan-out envelope serialization failed"),
            }
        }

        self.local.dispatch(BroadcastPayload {
            room,
            event_name: event_name.to_string(),
            data,
        });
    }

    /// Subscribe to the shared channel and spawn a task re-dispatching events
    /// published by other instances. The subscription is live when this
    /// returns. A dropped subscription is re-established until `shutdown`
    /// flips to `true`.
    pub async fn listen(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<Option<JoinHandle<()>>, ApiError> {
        let Some(bus) = &self.bus else {
            return Ok(None);
        };
        let bus = Arc::clone(bus);
        let mut stream = bus.subscribe(&[FANOUT_CHANNEL.to_string()]).await?;
        let fanout = Arc::clone(self);

        Ok(Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    message = stream.next() => match message {
                        Some(message) => fanout.redispatch(&message.payload),
                        None => {
                            tracing::warn!("fan-out subscription ended, resubscribing");
                            match resubscribe(bus.as_ref(), &mut shutdown).await {
                                Some(fresh) => stream = fresh,
                                None => break,
                            }
                        }
                    }
                }
            }
            tracing::info!("fan-out listener stopped");
        })))
    }

    /// Dispatch an event received from the shared channel, skipping our own.
    fn redispatch(&self, payload: &str) {
        let envelope: Envelope = match serde_json::from_str(payload) {
            Ok(e) => e,
            Err(err) => {
                tracing::warn!(?err, "dropping malformed fan-out envelope");
                return;
            }
        };
        if envelope.origin == self.instance_id {
            return;
        }
        self.local.dispatch(BroadcastPayload {
            room: envelope.room,
            event_name: envelope.t,
            data: envelope.d,
        });
    }
}

/// Retry the fan-out subscription every `RESUBSCRIBE_DELAY`. `None` once
/// shutdown is requested.
async fn resubscribe(
    bus: &dyn KeyValueStore,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<BoxStream<'static, PubSubMessage>> {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return None;
                }
                continue;
            }
            _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
        }

        match bus.subscribe(&[FANOUT_CHANNEL.to_string()]).await {
            Ok(stream) => {
                tracing::info!("fan-out subscription re-established");
                return Some(stream);
            }
            Err(err) => tracing::warn!(%err, "fan-out resubscribe failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::kv::MemoryStore;

    #[tokio::test]
    async fn bridged_instances_see_each_others_events() {
        let bus: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let a = Arc::new(Fanout::bridged(GatewayBroadcast::new(), bus.clone(), "inst_a"));
        let b = Arc::new(Fanout::bridged(GatewayBroadcast::new(), bus, "inst_b"));
        let (_shutdown_tx, shutdown) = watch::channel(false);
        a.listen(shutdown.clone()).await.unwrap();
        b.listen(shutdown).await.unwrap();

        let mut rx_a = a.local.subscribe();
        let mut rx_b = b.local.subscribe();

        a.emit(Room::chat("c1"), "STATUS_UPDATE", serde_json::json!({"x": 1}))
            .await;

        let local = rx_a.recv().await.unwrap();
        assert_eq!(local.room, Room::chat("c1"));
        let remote = rx_b.recv().await.unwrap();
        assert_eq!(remote.event_name, "STATUS_UPDATE");
        assert_eq!(remote.data["x"], 1);

        // The origin instance must not receive its own event twice.
        tokio::task::yield_now().await;
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn bridge_resubscribes_after_the_stream_ends() {
        let store = Arc::new(MemoryStore::new());
        let a = Arc::new(Fanout::bridged(GatewayBroadcast::new(), store.clone(), "inst_a"));
        let b = Arc::new(Fanout::bridged(GatewayBroadcast::new(), store.clone(), "inst_b"));
        let (_shutdown_tx, shutdown) = watch::channel(false);
        a.listen(shutdown.clone()).await.unwrap();
        b.listen(shutdown).await.unwrap();
        let mut rx_b = b.local.subscribe();

        store.disconnect_subscribers();
        assert_eq!(store.subscriber_count(), 0);
        tokio::time::timeout(Duration::from_secs(10), async {
            while store.subscriber_count() < 2 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("listeners did not resubscribe");

        a.emit(Room::user("bob"), "MESSAGE_STATUS_UPDATE", serde_json::json!({"y": 2}))
            .await;
        let remote = rx_b.recv().await.unwrap();
        assert_eq!(remote.room, Room::user("bob"));
        assert_eq!(remote.data["y"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn listener_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let fanout = Arc::new(Fanout::bridged(GatewayBroadcast::new(), store.clone(), "inst_a"));
        let (shutdown_tx, shutdown) = watch::channel(false);
        let task = fanout.listen(shutdown).await.unwrap().unwrap();

        // Also while it is waiting to resubscribe.
        store.disconnect_subscribers();
        tokio::task::yield_now().await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("listener did not stop")
            .unwrap();
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn local_fanout_has_no_listener() {
        let fanout = Arc::new(Fanout::local(GatewayBroadcast::new()));
        let (_shutdown_tx, shutdown) = watch::channel(false);
        assert!(fanout.listen(shutdown).await.unwrap().is_none());
    }
}
