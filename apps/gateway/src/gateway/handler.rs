//! REQUEST (op=4) dispatch: one handler per request name, answered with an ACK.

use chrono::Utc;
use murmur_common::id::{prefix, prefixed_ulid};
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::models::message::MessageStatus;
use crate::relay::{validate_content, RelayEnvelope};
use crate::AppState;

use super::events::{AckPayload, ClientRequest};
use super::rooms::Room;
use super::session::GatewaySession;

/// Handle a REQUEST and build its ACK. Rule violations become error ACKs.
pub async fn handle_request(
    state: &AppState,
    session: &GatewaySession,
    nonce: Option<String>,
    request: ClientRequest,
) -> AckPayload {
    match dispatch(state, session, request).await {
        Ok((message, data)) => AckPayload::ok(nonce, message, data),
        Err(err) => {
            tracing::debug!(
                connection_id = %session.connection_id,
                user_id = %session.user_id,
                %err,
                "request rejected"
            );
            AckPayload::error(nonce, &err)
        }
    }
}

async fn dispatch(
    state: &AppState,
    session: &GatewaySession,
    request: ClientRequest,
) -> Result<(&'static str, Option<Value>), ApiError> {
    let user_id = session.user_id.as_str();

    match request {
        ClientRequest::JoinChat(payload) => {
            require_member(state, &payload.chat_id, user_id).await?;
            session.join(Room::chat(payload.chat_id));
            Ok(("Joined chat", None))
        }
        ClientRequest::SendMessage(payload) => {
            validate_content(&payload.content)?;
            require_member(state, &payload.chat_id, user_id).await?;

            let envelope = RelayEnvelope {
                chat_id: payload.chat_id,
                sender_id: user_id.to_string(),
                content: payload.content,
                client_id: payload
                    .client_id
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| prefixed_ulid(prefix::MESSAGE_KEY)),
                sent_at: Utc::now(),
            };
            state.relay.publish(&envelope).await?;
            Ok((
                "Message queued",
                Some(json!({ "client_id": envelope.client_id })),
            ))
        }
        ClientRequest::MarkDelivered => {
            let by_sender = state.delivery.mark_delivered(user_id).await?;
            state
                .delivery
                .notify_senders(user_id, MessageStatus::Delivered, &by_sender)
                .await;
            Ok(("Messages marked delivered", Some(json!({ "count": count(&by_sender) }))))
        }
        ClientRequest::MarkSeen(payload) => {
            require_member(state, &payload.chat_id, user_id).await?;
            let by_sender = state.delivery.mark_seen(user_id, &payload.chat_id).await?;
            state
                .delivery
                .notify_senders(user_id, MessageStatus::Seen, &by_sender)
                .await;
            Ok(("Messages marked seen", Some(json!({ "count": count(&by_sender) }))))
        }
        ClientRequest::MarkNotificationsRead => {
            let updated = state.notifications.mark_all_read(user_id).await?;
            Ok(("Notifications marked read", Some(json!({ "updated": updated }))))
        }
    }
}

async fn require_member(state: &AppState, chat_id: &str, user_id: &str) -> Result<(), ApiError> {
    if state.directory.is_member(chat_id, user_id).await? {
        Ok(())
    } else {
        Err(ApiError::forbidden("Not a member of this chat"))
    }
}

fn count(by_sender: &super::delivery::BySender) -> usize {
    by_sender.values().map(Vec::len).sum()
}
