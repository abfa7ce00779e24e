//! Connection lifecycle: establish, heartbeat and disconnect sequences.

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::error::ApiError;
use crate::AppState;

use super::heartbeat::renew_heartbeat;
use super::presence::{PresenceRecord, PresenceStatus};
use super::rooms::Room;
use super::session::GatewaySession;

/// One friend's presence, pushed to a new connection in FRIENDS_STATUS.
#[derive(Debug, Clone, Serialize)]
pub struct FriendStatus {
    pub user_id: String,
    #[serde(flatten)]
    pub presence: PresenceRecord,
}

/// Result of bringing a connection online.
pub struct Established {
    pub session: GatewaySession,
    pub chats: Vec<String>,
    pub friends: Vec<FriendStatus>,
}

/// Register the connection, mark the user online, join their rooms, and
/// collect their friends' presence for the new connection.
///
/// Fails only if the connection cannot be registered or the user's chats
/// cannot be resolved; presence and heartbeat writes are best effort.
pub async fn on_establish(
    state: &AppState,
    connection_id: &str,
    user_id: &str,
) -> Result<Established, ApiError> {
    state.registry.add_connection(user_id, connection_id).await?;

    state
        .presence
        .update_and_broadcast(user_id, PresenceStatus::Online)
        .await;

    let session = GatewaySession::new(connection_id.to_string(), user_id.to_string());
    let chats = state.directory.chats_for_user(user_id).await?;
    for chat_id in &chats {
        session.join(Room::chat(chat_id.clone()));
    }

    let friends = friend_statuses(state, user_id).await;

    if let Err(err) = renew_heartbeat(state.kv.as_ref(), user_id, state.config.heartbeat_ttl_secs).await {
        tracing::warn!(%user_id, %err, "heartbeat renewal failed on connect");
    }

    state.delivery.deliver_pending(user_id).await;

    Ok(Established {
        session,
        chats,
        friends,
    })
}

/// One presence read per friend; unreadable friends are skipped.
async fn friend_statuses(state: &AppState, user_id: &str) -> Vec<FriendStatus> {
    let friend_ids = match state.directory.friends_of(user_id).await {
        Ok(ids) => ids,
        Err(err) => {
            tracing::warn!(%user_id, %err, "friend lookup failed");
            return Vec::new();
        }
    };

    let mut statuses = Vec::with_capacity(friend_ids.len());
    for friend_id in friend_ids {
        match state.presence.get_status(&friend_id).await {
            Ok(presence) => statuses.push(FriendStatus {
                user_id: friend_id,
                presence,
            }),
            Err(err) => tracing::warn!(%friend_id, %err, "friend presence read failed"),
        }
    }
    statuses
}

/// Client heartbeat: back to online (no-op broadcast if already online),
/// renew the heartbeat key, and acknowledge pending deliveries.
pub async fn on_heartbeat(state: &AppState, session: &GatewaySession) {
    let user_id = session.user_id.as_str();
    state
        .presence
        .update_and_broadcast(user_id, PresenceStatus::Online)
        .await;

    if let Err(err) = renew_heartbeat(state.kv.as_ref(), user_id, state.config.heartbeat_ttl_secs).await {
        tracing::warn!(%user_id, %err, "heartbeat renewal failed");
    }

    state.delivery.deliver_pending(user_id).await;
}

/// Schedule the offline check for a closed connection.
///
/// After the grace period the connection is removed and, if it was the
/// user's last one, presence becomes `Offline`. The timer is never
/// cancelled: a reconnect within the window registers a new connection id,
/// so the count stays above zero and no offline broadcast fires.
pub fn on_disconnect(state: &AppState, user_id: &str, connection_id: &str) -> JoinHandle<()> {
    let state = state.clone();
    let user_id = user_id.to_string();
    let connection_id = connection_id.to_string();
    let grace = state.config.disconnect_grace();

    tokio::spawn(async move {
        tokio::time::sleep(grace).await;

        if let Err(err) = state
            .registry
            .remove_connection(&user_id, &connection_id)
            .await
        {
            tracing::warn!(%user_id, %connection_id, %err, "connection removal failed");
            return;
        }

        match state.registry.count_connections(&user_id).await {
            Ok(0) => {
                state
                    .presence
                    .update_and_broadcast(&user_id, PresenceStatus::Offline)
                    .await;
            }
            Ok(remaining) => {
                tracing::debug!(%user_id, remaining, "user still connected after grace period");
            }
            Err(err) => tracing::warn!(%user_id, %err, "connection count failed"),
        }
    })
}
