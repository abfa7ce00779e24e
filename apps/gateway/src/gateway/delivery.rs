//! Delivered/seen acknowledgment tracking.
//!
//! Each user keeps a watermark per chat (`delivery:<user>:<chat>`, fields
//! `delivered` and `seen`) holding the newest message id already
//! acknowledged. Scans only look at ids above the watermark, which relies on
//! message ids increasing in creation order.
//!
//! The per-message `delivered_to`/`seen_by` sets are authoritative. The
//! append always happens before the watermark moves, and appends skip users
//! already present, so a crash between the two writes only costs a re-scan.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;

use crate::db::kv::KeyValueStore;
use crate::error::ApiError;
use crate::models::message::{Message, MessageStatus};
use crate::store::{ChatDirectory, MessageRepository};

use super::events::EventName;
use super::fanout::Fanout;
use super::rooms::Room;

const DELIVERED_FIELD: &str = "delivered";
const SEEN_FIELD: &str = "seen";

/// Affected messages grouped by their original sender.
pub type BySender = BTreeMap<String, Vec<Message>>;

pub fn delivery_key(user_id: &str, chat_id: &str) -> String {
    format!("delivery:{user_id}:{chat_id}")
}

#[derive(Clone)]
pub struct DeliveryTracker {
    kv: Arc<dyn KeyValueStore>,
    directory: Arc<dyn ChatDirectory>,
    messages: Arc<dyn MessageRepository>,
    fanout: Arc<Fanout>,
}

impl DeliveryTracker {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        directory: Arc<dyn ChatDirectory>,
        messages: Arc<dyn MessageRepository>,
        fanout: Arc<Fanout>,
    ) -> Self {
        Self {
            kv,
            directory,
            messages,
            fanout,
        }
    }

    pub async fn watermark(&self, user_id: &str, chat_id: &str, field: &str) -> Result<i64, ApiError> {
        let raw = self.kv.hash_get(&delivery_key(user_id, chat_id), field).await?;
        Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    pub async fn delivered_watermark(&self, user_id: &str, chat_id: &str) -> Result<i64, ApiError> {
        self.watermark(user_id, chat_id, DELIVERED_FIELD).await
    }

    pub async fn seen_watermark(&self, user_id: &str, chat_id: &str) -> Result<i64, ApiError> {
        self.watermark(user_id, chat_id, SEEN_FIELD).await
    }

    /// Acknowledge delivery of every message other members sent to the
    /// user's chats since the last call.
    pub async fn mark_delivered(&self, user_id: &str) -> Result<BySender, ApiError> {
        let mut by_sender = BySender::new();

        for chat_id in self.directory.chats_for_user(user_id).await? {
            let after = self.delivered_watermark(user_id, &chat_id).await?;
            let pending = self
                .messages
                .find_in_chat_after(&chat_id, after, user_id)
                .await?;
            let Some(newest) = pending.last().map(|m| m.id) else {
                continue;
            };

            let ids: Vec<i64> = pending.iter().map(|m| m.id).collect();
            let changed = self.messages.append_delivered(&ids, user_id).await?;
            self.advance(user_id, &chat_id, DELIVERED_FIELD, newest).await?;

            group_into(&mut by_sender, changed);
        }

        Ok(by_sender)
    }

    /// Acknowledge that the user has seen every message in `chat_id`.
    /// Seeing implies delivery, so both sets and both watermarks move.
    pub async fn mark_seen(&self, user_id: &str, chat_id: &str) -> Result<BySender, ApiError> {
        let after = self.seen_watermark(user_id, chat_id).await?;
        let pending = self
            .messages
            .find_in_chat_after(chat_id, after, user_id)
            .await?;
        let Some(newest) = pending.last().map(|m| m.id) else {
            return Ok(BySender::new());
        };

        let ids: Vec<i64> = pending.iter().map(|m| m.id).collect();
        self.messages.append_delivered(&ids, user_id).await?;
        let changed = self.messages.append_seen(&ids, user_id).await?;
        self.advance(user_id, chat_id, DELIVERED_FIELD, newest).await?;
        self.advance(user_id, chat_id, SEEN_FIELD, newest).await?;

        let mut by_sender = BySender::new();
        group_into(&mut by_sender, changed);
        Ok(by_sender)
    }

    /// Emit one `MESSAGE_STATUS_UPDATE` per sender, to that sender's room only.
    pub async fn notify_senders(&self, user_id: &str, ack: MessageStatus, by_sender: &BySender) {
        for (sender_id, messages) in by_sender {
            let data = json!({
                "user_id": user_id,
                "status": ack,
                "messages": messages
                    .iter()
                    .map(|m| json!({
                        "id": m.id.to_string(),
                        "chat_id": m.chat_id,
                        "status": m.status(),
                    }))
                    .collect::<Vec<_>>(),
            });
            self.fanout
                .emit(Room::user(sender_id.clone()), EventName::MESSAGE_STATUS_UPDATE, data)
                .await;
        }
    }

    /// `mark_delivered` plus sender notification, with errors logged rather
    /// than returned. Used on connect and heartbeat.
    pub async fn deliver_pending(&self, user_id: &str) {
        match self.mark_delivered(user_id).await {
            Ok(by_sender) => {
                self.notify_senders(user_id, MessageStatus::Delivered, &by_sender)
                    .await
            }
            Err(err) => tracing::warn!(%user_id, %err, "piggy-backed mark_delivered failed"),
        }
    }

    async fn advance(&self, user_id: &str, chat_id: &str, field: &str, id: i64) -> Result<(), ApiError> {
        self.kv
            .hash_set_max(&delivery_key(user_id, chat_id), field, id)
            .await?;
        Ok(())
    }
}

fn group_into(by_sender: &mut BySender, messages: Vec<Message>) {
    for message in messages {
        by_sender
            .entry(message.sender_id.clone())
            .or_default()
            .push(message);
    }
}
