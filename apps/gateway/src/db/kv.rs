use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::ApiError;

/// A message received on a pub/sub channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

/// Abstraction over the shared key-value store that holds cross-process
/// presence state: connection sets, presence records, heartbeat keys,
/// delivery watermarks, connection tickets and the leader lease.
///
/// Backed by Redis in production and an in-memory map in tests. Every method
/// is a single atomic operation against the store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), ApiError>;
    async fn get(&self, key: &str) -> Result<Option<String>, ApiError>;
    async fn del(&self, key: &str) -> Result<(), ApiError>;
    /// Read and delete in one step (single-use values).
    async fn get_del(&self, key: &str) -> Result<Option<String>, ApiError>;
    /// Write `value` without expiry and return the value it replaced.
    async fn swap(&self, key: &str, value: &str) -> Result<Option<String>, ApiError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<(), ApiError>;
    async fn set_remove(&self, key: &str, member: &str) -> Result<(), ApiError>;
    async fn set_len(&self, key: &str) -> Result<u64, ApiError>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, ApiError>;
    /// Set `field` to `value` only if it is greater than the stored value.
    /// Returns the value stored after the call.
    async fn hash_set_max(&self, key: &str, field: &str, value: i64) -> Result<i64, ApiError>;

    /// Take or extend a lease on `key` for `owner`. Returns whether `owner`
    /// holds the lease after the call.
    async fn acquire_lease(&self, key: &str, owner: &str, ttl_ms: u64) -> Result<bool, ApiError>;
    /// Drop the lease if `owner` still holds it.
    async fn release_lease(&self, key: &str, owner: &str) -> Result<(), ApiError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), ApiError>;
    async fn subscribe(
        &self,
        channels: &[String],
    ) -> Result<BoxStream<'static, PubSubMessage>, ApiError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation (single process / tests)
// ---------------------------------------------------------------------------

const PUBSUB_CAPACITY: usize = 1024;

enum Value {
    Str(String),
    Set(HashSet<String>),
    Hash(HashMap<String, String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

pub struct MemoryStore {
    data: Mutex<HashMap<String, Entry>>,
    bus: Mutex<broadcast::Sender<PubSubMessage>>,
    expiry_channel: String,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_expiry_channel("__keyevent@0__:expired")
    }

    pub fn with_expiry_channel(channel: &str) -> Self {
        let (bus, _) = broadcast::channel(PUBSUB_CAPACITY);
        Self {
            data: Mutex::new(HashMap::new()),
            bus: Mutex::new(bus),
            expiry_channel: channel.to_string(),
        }
    }

    /// Expire `key` immediately and announce it on the expiry channel, as
    /// Redis does when keyspace notifications are enabled.
    pub fn expire_now(&self, key: &str) {
        let removed = self.data.lock().remove(key).is_some();
        if removed {
            let _ = self.bus.lock().send(PubSubMessage {
                channel: self.expiry_channel.clone(),
                payload: key.to_string(),
            });
        }
    }

    /// Number of live pub/sub subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.bus.lock().receiver_count()
    }

    /// End every open subscription stream, as a dropped Redis pub/sub
    /// connection does. Later subscriptions work normally.
    pub fn disconnect_subscribers(&self) {
        let (fresh, _) = broadcast::channel(PUBSUB_CAPACITY);
        drop(std::mem::replace(&mut *self.bus.lock(), fresh));
    }

    /// Remaining TTL of a key, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let data = self.data.lock();
        let at = data.get(key)?.expires_at?;
        Some(at.saturating_duration_since(Instant::now()))
    }

    fn with_live<R>(&self, key: &str, f: impl FnOnce(Option<&Entry>) -> R) -> R {
        let mut data = self.data.lock();
        let now = Instant::now();
        if data.get(key).is_some_and(|e| !e.is_live(now)) {
            data.remove(key);
        }
        f(data.get(key))
    }

    fn wrong_type(key: &str) -> ApiError {
        tracing::error!(%key, "kv operation against a key holding the wrong kind of value");
        ApiError::internal("Wrong kind of value for key")
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), ApiError> {
        self.data.lock().insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, ApiError> {
        self.with_live(key, |entry| match entry.map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(Self::wrong_type(key)),
        })
    }

    async fn del(&self, key: &str) -> Result<(), ApiError> {
        self.data.lock().remove(key);
        Ok(())
    }

    async fn get_del(&self, key: &str) -> Result<Option<String>, ApiError> {
        let value = self.get(key).await?;
        if value.is_some() {
            self.data.lock().remove(key);
        }
        Ok(value)
    }

    async fn swap(&self, key: &str, value: &str) -> Result<Option<String>, ApiError> {
        let mut data = self.data.lock();
        let now = Instant::now();
        let previous = match data.remove(key) {
            Some(entry) if entry.is_live(now) => match entry.value {
                Value::Str(s) => Some(s),
                other => {
                    data.insert(
                        key.to_string(),
                        Entry {
                            value: other,
                            expires_at: entry.expires_at,
                        },
                    );
                    return Err(Self::wrong_type(key));
                }
            },
            _ => None,
        };
        data.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: None,
            },
        );
        Ok(previous)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), ApiError> {
        let mut data = self.data.lock();
        let entry = data.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Set(HashSet::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Set(set) => {
                set.insert(member.to_string());
                Ok(())
            }
            _ => Err(Self::wrong_type(key)),
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), ApiError> {
        let mut data = self.data.lock();
        let now_empty = match data.get_mut(key).map(|e| &mut e.value) {
            None => return Ok(()),
            Some(Value::Set(set)) => {
                set.remove(member);
                set.is_empty()
            }
            Some(_) => return Err(Self::wrong_type(key)),
        };
        // Redis deletes empty sets.
        if now_empty {
            data.remove(key);
        }
        Ok(())
    }

    async fn set_len(&self, key: &str) -> Result<u64, ApiError> {
        self.with_live(key, |entry| match entry.map(|e| &e.value) {
            None => Ok(0),
            Some(Value::Set(set)) => Ok(set.len() as u64),
            Some(_) => Err(Self::wrong_type(key)),
        })
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, ApiError> {
        self.with_live(key, |entry| match entry.map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(_) => Err(Self::wrong_type(key)),
        })
    }

    async fn hash_set_max(&self, key: &str, field: &str, value: i64) -> Result<i64, ApiError> {
        let mut data = self.data.lock();
        let entry = data.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Hash(hash) => {
                let current = hash.get(field).and_then(|v| v.parse::<i64>().ok());
                match current {
                    Some(current) if current >= value => Ok(current),
                    _ => {
                        hash.insert(field.to_string(), value.to_string());
                        Ok(value)
                    }
                }
            }
            _ => Err(Self::wrong_type(key)),
        }
    }

    async fn acquire_lease(&self, key: &str, owner: &str, ttl_ms: u64) -> Result<bool, ApiError> {
        let mut data = self.data.lock();
        let now = Instant::now();
        let holder = data
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| match &e.value {
                Value::Str(s) => Some(s.clone()),
                _ => None,
            });
        match holder {
            Some(current) if current != owner => Ok(false),
            _ => {
                data.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Str(owner.to_string()),
                        expires_at: Some(now + Duration::from_millis(ttl_ms)),
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release_lease(&self, key: &str, owner: &str) -> Result<(), ApiError> {
        let mut data = self.data.lock();
        let held = matches!(data.get(key).map(|e| &e.value), Some(Value::Str(s)) if s == owner);
        if held {
            data.remove(key);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), ApiError> {
        // No subscribers is not an error.
        let _ = self.bus.lock().send(PubSubMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        channels: &[String],
    ) -> Result<BoxStream<'static, PubSubMessage>, ApiError> {
        let wanted: HashSet<String> = channels.iter().cloned().collect();
        let rx = self.bus.lock().subscribe();
        let stream = stream::unfold((rx, wanted), |(mut rx, wanted)| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) if wanted.contains(&msg.channel) => return Some((msg, (rx, wanted))),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "memory pub/sub subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}
