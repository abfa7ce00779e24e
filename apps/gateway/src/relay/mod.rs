//! Message relay: composed messages go through a broker topic keyed by chat
//! id, and a consumer-group loop in any gateway process persists each one
//! and fans it out to the chat room.
//!
//! Offsets are committed only once a record has been fully handled:
//! persisted and emitted, or rejected and reported to its sender. Transient
//! failures are retried with backoff, and the unique `client_id` makes a
//! retried or redelivered insert return the stored row instead of a copy.
//! Every envelope carries one: the gateway mints a key when the client
//! sends none.

pub mod kafka;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;

use crate::error::{ApiError, FieldError};
use crate::gateway::events::EventName;
use crate::gateway::rooms::Room;
use crate::models::message::{Message, NewMessage};
use crate::models::user::UserProfile;
use crate::AppState;

/// Longest accepted message body, in characters.
pub const MAX_CONTENT_LEN: usize = 4000;

const MAX_ATTEMPTS: u32 = 5;
const BASE_BACKOFF: Duration = Duration::from_millis(100);
const RECV_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// A composed message as it travels through the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    /// Idempotency key, unique per composed message.
    pub client_id: String,
    pub sent_at: DateTime<Utc>,
}

/// One record read from the broker.
#[derive(Debug, Clone)]
pub struct RelayRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait RelayProducer: Send + Sync {
    /// Publish to the relay topic, keyed by `chat_id`.
    async fn publish(&self, envelope: &RelayEnvelope) -> Result<(), ApiError>;
}

#[async_trait]
pub trait RelaySource: Send {
    /// Next record, or `None` once the source is closed.
    async fn recv(&mut self) -> Result<Option<RelayRecord>, ApiError>;
    /// Mark `record` and everything before it in its partition as handled.
    async fn commit(&mut self, record: &RelayRecord) -> Result<(), ApiError>;
}

/// Reject empty or oversized message bodies.
pub fn validate_content(content: &str) -> Result<(), ApiError> {
    let message = if content.trim().is_empty() {
        "Message content is required"
    } else if content.chars().count() > MAX_CONTENT_LEN {
        "Message content is too long"
    } else {
        return Ok(());
    };
    Err(ApiError::validation(vec![FieldError {
        field: "content".to_string(),
        message: message.to_string(),
    }]))
}

#[derive(Serialize)]
struct MessageCreateEvent<'a> {
    #[serde(flatten)]
    message: &'a Message,
    sender: UserProfile,
}

/// Persist an envelope and emit `MESSAGE_CREATE` to its chat room.
pub async fn persist_and_emit(
    state: &AppState,
    envelope: &RelayEnvelope,
) -> Result<Message, ApiError> {
    validate_content(&envelope.content)?;
    if !state
        .directory
        .is_member(&envelope.chat_id, &envelope.sender_id)
        .await?
    {
        return Err(ApiError::forbidden("Not a member of this chat"));
    }

    let new_message = NewMessage::new(
        state.snowflake.generate(),
        &envelope.chat_id,
        &envelope.sender_id,
        &envelope.content,
        Some(envelope.client_id.clone()),
    );
    let (message, created) = state.messages.create_message(new_message).await?;
    if !created {
        tracing::info!(
            message_id = message.id,
            client_id = ?message.client_id,
            "relay redelivery matched an existing message"
        );
    }

    let sender = state
        .directory
        .user_profile(&envelope.sender_id)
        .await?
        .unwrap_or_else(|| UserProfile::unknown(&envelope.sender_id));
    let data = serde_json::to_value(MessageCreateEvent {
        message: &message,
        sender,
    })?;
    state
        .fanout
        .emit(Room::chat(envelope.chat_id.clone()), EventName::MESSAGE_CREATE, data)
        .await;

    Ok(message)
}

/// Handle one broker record until it is safe to commit.
pub async fn process_record(state: &AppState, record: &RelayRecord) {
    let envelope: RelayEnvelope = match serde_json::from_slice(&record.payload) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::warn!(
                partition = record.partition,
                offset = record.offset,
                ?err,
                "dropping undecodable relay record"
            );
            return;
        }
    };

    let mut attempt = 0;
    loop {
        attempt += 1;
        match persist_and_emit(state, &envelope).await {
            Ok(message) => {
                tracing::debug!(message_id = message.id, chat_id = %message.chat_id, "relayed message");
                return;
            }
            Err(err) if err.is_transient() && attempt < MAX_ATTEMPTS => {
                let delay = BASE_BACKOFF * 2u32.pow(attempt - 1);
                tracing::warn!(%err, attempt, ?delay, "relay persist failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                tracing::warn!(
                    %err,
                    sender_id = %envelope.sender_id,
                    chat_id = %envelope.chat_id,
                    "relay rejected message"
                );
                report_failure(state, &envelope, &err).await;
                return;
            }
        }
    }
}

/// Tell the sender their fire-and-forget send failed.
async fn report_failure(state: &AppState, envelope: &RelayEnvelope, err: &ApiError) {
    let data = json!({
        "client_id": envelope.client_id,
        "chat_id": envelope.chat_id,
        "status_code": err.status.as_u16(),
        "code": err.code,
        "message": err.message,
    });
    state
        .fanout
        .emit(Room::user(envelope.sender_id.clone()), EventName::ERROR, data)
        .await;
}

/// Consume `source` until it closes or `shutdown` flips to `true`.
pub async fn run_consumer(
    state: AppState,
    mut source: Box<dyn RelaySource>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("relay consumer started");
    loop {
        let next = tokio::select! {
            next = source.recv() => next,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        let record = match next {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::info!("relay source closed");
                break;
            }
            Err(err) => {
                tracing::warn!(%err, "relay receive failed");
                tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                continue;
            }
        };

        process_record(&state, &record).await;

        if let Err(err) = source.commit(&record).await {
            // The record will be redelivered; the client_id key keeps it single.
            tracing::warn!(%err, partition = record.partition, offset = record.offset, "relay commit failed");
        }
    }
    tracing::info!("relay consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_must_be_present_and_bounded() {
        assert!(validate_content("hi").is_ok());
        assert_eq!(validate_content("   ").unwrap_err().code, "VALIDATION_ERROR");
        assert!(validate_content(&"x".repeat(MAX_CONTENT_LEN)).is_ok());
        assert!(validate_content(&"x".repeat(MAX_CONTENT_LEN + 1)).is_err());
    }

    #[test]
    fn envelope_without_client_id_is_undecodable() {
        let keyless = serde_json::from_value::<RelayEnvelope>(json!({
            "chat_id": "c1",
            "sender_id": "u1",
            "content": "hi",
            "sent_at": "2026-01-01T00:00:00Z",
        }));
        assert!(keyless.is_err());
    }
}
