//! Redis-backed [`KeyValueStore`].

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};

use super::kv::{KeyValueStore, PubSubMessage};
use crate::error::ApiError;

/// Raise a hash field to a new decimal id, never lowering it.
///
/// Ids exceed the 2^53 range of Lua numbers, so values are compared as
/// decimal strings: a longer string is larger, equal lengths compare
/// lexicographically. Only non-negative ids are stored.
const HASH_SET_MAX: &str = r#"
local current = redis.call('HGET', KEYS[1], ARGV[1])
local candidate = ARGV[2]
if (not current)
    or string.len(candidate) > string.len(current)
    or (string.len(candidate) == string.len(current) and candidate > current) then
  redis.call('HSET', KEYS[1], ARGV[1], candidate)
  return candidate
end
return current
"#;

const ACQUIRE_LEASE: &str = r#"
local holder = redis.call('GET', KEYS[1])
if not holder then
  redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
  return 1
end
if holder == ARGV[1] then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  return 1
end
return 0
"#;

const RELEASE_LEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, ApiError> {
        let client = Client::open(redis_url)?;
        let conn = ConnectionManager::new(client.clone()).await?;

        let mut ping = conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut ping).await?;

        tracing::info!("redis connection established");

        Ok(Self { client, conn })
    }

    /// Ask Redis to publish keyevent notifications for expired keys.
    ///
    /// Managed Redis offerings often reject CONFIG; the setting then has to be
    /// applied out of band, so failure is only logged.
    pub async fn enable_expiry_notifications(&self) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("Ex")
            .query_async(&mut conn)
            .await;
        if let Err(err) = result {
            tracing::warn!(
                ?err,
                "could not enable keyspace expiry notifications; idle detection needs notify-keyspace-events=Ex"
            );
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), ApiError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl_secs).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, ApiError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn del(&self, key: &str) -> Result<(), ApiError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn get_del(&self, key: &str) -> Result<Option<String>, ApiError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GETDEL").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn swap(&self, key: &str, value: &str) -> Result<Option<String>, ApiError> {
        let mut conn = self.conn.clone();
        // SET .. GET (Redis >= 6.2) writes and returns the old value in one command.
        let previous: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("GET")
            .query_async(&mut conn)
            .await?;
        Ok(previous)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), ApiError> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(key, member).await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), ApiError> {
        let mut conn = self.conn.clone();
        let _: () = conn.srem(key, member).await?;
        Ok(())
    }

    async fn set_len(&self, key: &str) -> Result<u64, ApiError> {
        let mut conn = self.conn.clone();
        Ok(conn.scard(key).await?)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, ApiError> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn hash_set_max(&self, key: &str, field: &str, value: i64) -> Result<i64, ApiError> {
        if value < 0 {
            return Err(ApiError::bad_request("Watermarks must be non-negative"));
        }
        let mut conn = self.conn.clone();
        let stored: String = Script::new(HASH_SET_MAX)
            .key(key)
            .arg(field)
            .arg(value.to_string())
            .invoke_async(&mut conn)
            .await?;
        stored.parse().map_err(|_| {
            tracing::error!(%key, %field, %stored, "non-numeric watermark in redis");
            ApiError::internal("Corrupt watermark")
        })
    }

    async fn acquire_lease(&self, key: &str, owner: &str, ttl_ms: u64) -> Result<bool, ApiError> {
        let mut conn = self.conn.clone();
        let held: i64 = Script::new(ACQUIRE_LEASE)
            .key(key)
            .arg(owner)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(held == 1)
    }

    async fn release_lease(&self, key: &str, owner: &str) -> Result<(), ApiError> {
        let mut conn = self.conn.clone();
        let _: i64 = Script::new(RELEASE_LEASE)
            .key(key)
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), ApiError> {
        let mut conn = self.conn.clone();
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        channels: &[String],
    ) -> Result<BoxStream<'static, PubSubMessage>, ApiError> {
        // Pub/sub needs a dedicated connection; the manager is multiplexed.
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(channel).await?;
        }

        let stream = pubsub.into_on_message().filter_map(|msg| {
            let parsed = match msg.get_payload::<String>() {
                Ok(payload) => Some(PubSubMessage {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                }),
                Err(err) => {
                    tracing::warn!(?err, "dropping non-utf8 pub/sub payload");
                    None
                }
            };
            futures_util::future::ready(parsed)
        });

        Ok(stream.boxed())
    }
}
