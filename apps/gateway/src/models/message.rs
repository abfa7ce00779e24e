use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::db::schema::messages;

/// Denormalized delivery state of a message.
///
/// `Delivered`/`Seen` mean every recipient (all chat members except the
/// sender) appears in `delivered_to`/`seen_by`. Per-recipient detail lives in
/// those sets; the status only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent = 0,
    Delivered = 1,
    Seen = 2,
}

impl MessageStatus {
    pub fn from_i16(value: i16) -> Self {
        match value {
            2 => Self::Seen,
            1 => Self::Delivered,
            _ => Self::Sent,
        }
    }

    pub fn as_i16(self) -> i16 {
        self as i16
    }

    /// Project the status from acknowledgment counts. A chat with no other
    /// members never leaves `Sent`.
    pub fn project(delivered: usize, seen: usize, recipients: usize) -> Self {
        if recipients == 0 {
            Self::Sent
        } else if seen >= recipients {
            Self::Seen
        } else if delivered >= recipients {
            Self::Delivered
        } else {
            Self::Sent
        }
    }
}

fn serialize_id<S: serde::Serializer>(val: &i64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&val.to_string())
}

fn serialize_status<S: serde::Serializer>(val: &i16, s: S) -> Result<S::Ok, S::Error> {
    MessageStatus::from_i16(*val).serialize(s)
}

#[derive(Debug, Clone, Queryable, Selectable, QueryableByName, Serialize)]
#[diesel(table_name = messages)]
pub struct Message {
    #[serde(serialize_with = "serialize_id")]
    pub id: i64,
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(serialize_with = "serialize_status")]
    pub status: i16,
    pub delivered_to: Vec<String>,
    pub seen_by: Vec<String>,
    pub client_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn status(&self) -> MessageStatus {
        MessageStatus::from_i16(self.status)
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = messages)]
pub struct NewMessage {
    pub id: i64,
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    pub status: i16,
    pub delivered_to: Vec<String>,
    pub seen_by: Vec<String>,
    pub client_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewMessage {
    pub fn new(
        id: i64,
        chat_id: &str,
        sender_id: &str,
        content: &str,
        client_id: Option<String>,
    ) -> Self {
        Self {
            id,
            chat_id: chat_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            status: MessageStatus::Sent.as_i16(),
            delivered_to: Vec::new(),
            seen_by: Vec::new(),
            client_id,
            created_at: Utc::now(),
        }
    }

    pub fn into_message(self) -> Message {
        Message {
            id: self.id,
            chat_id: self.chat_id,
            sender_id: self.sender_id,
            content: self.content,
            status: self.status,
            delivered_to: self.delivered_to,
            seen_by: self.seen_by,
            client_id: self.client_id,
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_requires_every_recipient() {
        assert_eq!(MessageStatus::project(1, 0, 2), MessageStatus::Sent);
        assert_eq!(MessageStatus::project(2, 0, 2), MessageStatus::Delivered);
        assert_eq!(MessageStatus::project(2, 1, 2), MessageStatus::Delivered);
        assert_eq!(MessageStatus::project(2, 2, 2), MessageStatus::Seen);
        assert_eq!(MessageStatus::project(0, 0, 0), MessageStatus::Sent);
    }

    #[test]
    fn serializes_id_as_string_and_status_as_name() {
        let msg = NewMessage::new(42, "c1", "u1", "hi", None).into_message();
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["id"], "42");
        assert_eq!(json["status"], "sent");
        assert_eq!(json["delivered_to"], serde_json::json!([]));
    }
}
