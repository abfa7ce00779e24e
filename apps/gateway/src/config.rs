use std::time::Duration;

use murmur_common::snowflake::MAX_WORKER_ID;

/// Gateway configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string.
    pub database_url: String,
    /// Redis connection string. The trailing path segment selects the logical DB.
    pub redis_url: String,
    /// Comma-separated Kafka bootstrap servers. `None` runs the in-process broker.
    pub kafka_brokers: Option<String>,
    /// Topic carrying composed chat messages, keyed by chat id.
    pub kafka_topic: String,
    /// Consumer group shared by every gateway process.
    pub kafka_group_id: String,
    /// TTL of the per-user heartbeat key. Expiry demotes a connected user to idle.
    pub heartbeat_ttl_secs: u64,
    /// Delay between a socket closing and the offline check for its user.
    pub disconnect_grace_secs: u64,
    /// Whether this process competes for the heartbeat-watcher lease.
    pub heartbeat_watcher: bool,
    /// Lease duration for the heartbeat-watcher leader key.
    pub leader_lease_ms: u64,
    /// Snowflake worker id, `0..=1023`. Must be unique per process.
    pub worker_id: u16,
    /// Port the HTTP server binds to.
    pub port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        Self {
            database_url: required_var("DATABASE_URL"),
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379/0".to_string()),
            kafka_brokers: std::env::var("KAFKA_BROKERS").ok().filter(|s| !s.is_empty()),
            kafka_topic: std::env::var("KAFKA_TOPIC")
                .unwrap_or_else(|_| "chat-messages".to_string()),
            kafka_group_id: std::env::var("KAFKA_GROUP_ID")
                .unwrap_or_else(|_| "murmur-relay".to_string()),
            heartbeat_ttl_secs: parsed_var("HEARTBEAT_TTL_SECS", 45),
            disconnect_grace_secs: parsed_var("DISCONNECT_GRACE_SECS", 5),
            heartbeat_watcher: parsed_var("HEARTBEAT_WATCHER", true),
            leader_lease_ms: parsed_var("LEADER_LEASE_MS", 15_000),
            worker_id: std::env::var("WORKER_ID").map_or(0, |raw| checked_worker_id(&raw)),
            port: parsed_var("PORT", 4002),
        }
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }

    /// Heartbeat interval advertised to clients in READY, in milliseconds.
    ///
    /// Two thirds of the key TTL, so one late heartbeat does not trip idle.
    pub fn heartbeat_interval_ms(&self) -> u64 {
        self.heartbeat_ttl_secs * 1000 * 2 / 3
    }

    /// Logical Redis database index taken from the URL path (`redis://host/3`).
    pub fn redis_db(&self) -> u32 {
        self.redis_url
            .rsplit('/')
            .next()
            .and_then(|segment| segment.parse().ok())
            .unwrap_or(0)
    }

    /// Pub/sub channel on which Redis announces expired keys.
    pub fn expiry_channel(&self) -> String {
        format!("__keyevent@{}__:expired", self.redis_db())
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

/// Message ids embed the worker id in 10 bits; a wider value would alias
/// another worker, so it is rejected rather than truncated.
fn checked_worker_id(raw: &str) -> u16 {
    match raw.trim().parse::<u16>() {
        Ok(id) if id <= MAX_WORKER_ID => id,
        _ => panic!("WORKER_ID must be an integer from 0 to {MAX_WORKER_ID}, got {raw:?}"),
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_redis(url: &str) -> Config {
        Config {
            database_url: String::new(),
            redis_url: url.to_string(),
            kafka_brokers: None,
            kafka_topic: "chat-messages".to_string(),
            kafka_group_id: "murmur-relay".to_string(),
            heartbeat_ttl_secs: 45,
            disconnect_grace_secs: 5,
            heartbeat_watcher: true,
            leader_lease_ms: 15_000,
            worker_id: 0,
            port: 4002,
        }
    }

    #[test]
    fn expiry_channel_follows_redis_db() {
        assert_eq!(
            config_with_redis("redis://localhost:6379/3").expiry_channel(),
            "__keyevent@3__:expired"
        );
        assert_eq!(
            config_with_redis("redis://localhost:6379").expiry_channel(),
            "__keyevent@0__:expired"
        );
    }

    #[test]
    fn heartbeat_interval_is_shorter_than_ttl() {
        let config = config_with_redis("redis://localhost:6379/0");
        assert_eq!(config.heartbeat_interval_ms(), 30_000);
        assert!(config.heartbeat_interval_ms() < config.heartbeat_ttl().as_millis() as u64);
    }

    #[test]
    fn worker_id_accepts_the_full_range() {
        assert_eq!(checked_worker_id("0"), 0);
        assert_eq!(checked_worker_id(" 1023 "), 1023);
    }

    #[test]
    #[should_panic(expected = "WORKER_ID must be an integer from 0 to 1023")]
    fn worker_id_wider_than_ten_bits_is_rejected() {
        checked_worker_id("1029");
    }

    #[test]
    #[should_panic(expected = "WORKER_ID")]
    fn unparsable_worker_id_is_rejected() {
        checked_worker_id("70000");
    }
}
