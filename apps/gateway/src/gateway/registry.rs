//! Online-socket registry: the set of live connection ids per user, kept in
//! the shared store so every gateway process sees the same sets.
//!
//! An empty (absent) set means the user is fully offline.

use std::sync::Arc;

use crate::db::kv::KeyValueStore;
use crate::error::ApiError;

const ONLINE_PREFIX: &str = "online:";

pub fn online_key(user_id: &str) -> String {
    format!("{ONLINE_PREFIX}{user_id}")
}

#[derive(Clone)]
pub struct OnlineRegistry {
    kv: Arc<dyn KeyValueStore>,
}

impl OnlineRegistry {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Idempotent: adding the same connection twice leaves one entry.
    pub async fn add_connection(&self, user_id: &str, connection_id: &str) -> Result<(), ApiError> {
        self.kv.set_add(&online_key(user_id), connection_id).await
    }

    /// Idempotent; removing an unknown connection is not an error.
    pub async fn remove_connection(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> Result<(), ApiError> {
        self.kv.set_remove(&online_key(user_id), connection_id).await
    }

    pub async fn count_connections(&self, user_id: &str) -> Result<u64, ApiError> {
        self.kv.set_len(&online_key(user_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::kv::MemoryStore;

    #[tokio::test]
    async fn add_is_idempotent_and_remove_tolerates_unknown() {
        let registry = OnlineRegistry::new(Arc::new(MemoryStore::new()));
        registry.add_connection("alice", "conn_1").await.unwrap();
        registry.add_connection("alice", "conn_1").await.unwrap();
        registry.add_connection("alice", "conn_2").await.unwrap();
        assert_eq!(registry.count_connections("alice").await.unwrap(), 2);

        registry.remove_connection("alice", "conn_9").await.unwrap();
        registry.remove_connection("alice", "conn_1").await.unwrap();
        registry.remove_connection("alice", "conn_1").await.unwrap();
        assert_eq!(registry.count_connections("alice").await.unwrap(), 1);
        assert_eq!(registry.count_connections("bob").await.unwrap(), 0);
    }
}
