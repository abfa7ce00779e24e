//! Per-user presence records and the compare-and-broadcast transition.
//!
//! Presence is per-**user**, not per-connection, and lives in the shared
//! store so every gateway process agrees on it. A missing record means the
//! user is offline.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db::kv::KeyValueStore;
use crate::error::ApiError;
use crate::store::ChatDirectory;

use super::events::EventName;
use super::fanout::Fanout;
use super::rooms::Room;

const PRESENCE_PREFIX: &str = "presence:";

pub fn presence_key(user_id: &str) -> String {
    format!("{PRESENCE_PREFIX}{user_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Idle,
    Offline,
}

/// Stored presence of one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PresenceRecord {
    pub status: PresenceStatus,
    /// Time of the last status write. `None` for users never seen.
    pub last_active: Option<DateTime<Utc>>,
}

impl PresenceRecord {
    pub fn offline() -> Self {
        Self {
            status: PresenceStatus::Offline,
            last_active: None,
        }
    }

    fn decode(user_id: &str, raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|err| {
            tracing::warn!(%user_id, ?err, "unreadable presence record, treating as offline");
            Self::offline()
        })
    }
}

#[derive(Clone)]
pub struct PresenceService {
    kv: Arc<dyn KeyValueStore>,
    directory: Arc<dyn ChatDirectory>,
    fanout: Arc<Fanout>,
}

impl PresenceService {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        directory: Arc<dyn ChatDirectory>,
        fanout: Arc<Fanout>,
    ) -> Self {
        Self {
            kv,
            directory,
            fanout,
        }
    }

    /// Record `status` for the user and, if it differs from the previous
    /// status, emit `STATUS_UPDATE` to every chat room the user belongs to.
    ///
    /// Never fails: presence is best effort, so errors are logged and
    /// reported as "no broadcast". Returns whether a broadcast went out.
    pub async fn update_and_broadcast(&self, user_id: &str, status: PresenceStatus) -> bool {
        match self.try_update(user_id, status).await {
            Ok(broadcast) => broadcast,
            Err(err) => {
                tracing::warn!(%user_id, ?status, %err, "presence update failed");
                false
            }
        }
    }

    async fn try_update(&self, user_id: &str, status: PresenceStatus) -> Result<bool, ApiError> {
        let record = PresenceRecord {
            status,
            last_active: Some(Utc::now()),
        };
        let json = serde_json::to_string(&record)?;

        // Write and read back the previous value in one round trip so two
        // processes racing on the same user cannot both see the old status.
        let previous = self
            .kv
            .swap(&presence_key(user_id), &json)
            .await?
            .map(|raw| PresenceRecord::decode(user_id, &raw).status)
            .unwrap_or(PresenceStatus::Offline);

        if previous == status {
            return Ok(false);
        }

        let chats = self.directory.chats_for_user(user_id).await?;
        let data = serde_json::json!({
            "user_id": user_id,
            "status": record.status,
            "last_active": record.last_active,
        });
        for chat_id in chats {
            self.fanout
                .emit(Room::chat(chat_id), EventName::STATUS_UPDATE, data.clone())
                .await;
        }

        tracing::debug!(%user_id, from = ?previous, to = ?status, "presence changed");
        Ok(true)
    }

    /// Current presence of a user, `Offline` when no record exists.
    pub async fn get_status(&self, user_id: &str) -> Result<PresenceRecord, ApiError> {
        Ok(self
            .kv
            .get(&presence_key(user_id))
            .await?
            .map(|raw| PresenceRecord::decode(user_id, &raw))
            .unwrap_or_else(PresenceRecord::offline))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::kv::MemoryStore;
    use crate::gateway::fanout::GatewayBroadcast;
    use crate::store::MemoryRecords;

    fn service() -> (PresenceService, GatewayBroadcast, Arc<MemoryStore>) {
        let kv = Arc::new(MemoryStore::new());
        let records = Arc::new(MemoryRecords::new());
        records.add_chat("c1", &["alice", "bob"]);
        records.add_chat("c2", &["alice"]);
        let local = GatewayBroadcast::new();
        let fanout = Arc::new(Fanout::local(local.clone()));
        (PresenceService::new(kv.clone(), records, fanout), local, kv)
    }

    #[tokio::test]
    async fn broadcasts_once_per_transition() {
        let (presence, local, _) = service();
        let mut rx = local.subscribe();

        assert!(presence.update_and_broadcast("alice", PresenceStatus::Online).await);
        let mut rooms = vec![rx.try_recv().unwrap().room.clone(), rx.try_recv().unwrap().room.clone()];
        rooms.sort();
        assert_eq!(rooms, vec![Room::chat("c1"), Room::chat("c2")]);

        assert!(!presence.update_and_broadcast("alice", PresenceStatus::Online).await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn repeated_write_still_refreshes_last_active() {
        let (presence, _, _) = service();
        presence.update_and_broadcast("alice", PresenceStatus::Online).await;
        let first = presence.get_status("alice").await.unwrap();
        presence.update_and_broadcast("alice", PresenceStatus::Online).await;
        let second = presence.get_status("alice").await.unwrap();
        assert!(second.last_active >= first.last_active);
    }

    #[tokio::test]
    async fn missing_record_is_offline() {
        let (presence, local, _) = service();
        let mut rx = local.subscribe();
        assert_eq!(
            presence.get_status("nobody").await.unwrap(),
            PresenceRecord::offline()
        );
        assert!(!presence.update_and_broadcast("nobody", PresenceStatus::Offline).await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unreadable_record_counts_as_offline() {
        let (presence, _, kv) = service();
        kv.swap(&presence_key("alice"), "not json").await.unwrap();
        assert!(presence.update_and_broadcast("alice", PresenceStatus::Online).await);
    }
}
