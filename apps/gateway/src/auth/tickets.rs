//! Single-use WebSocket connection tickets.
//!
//! The upstream auth service authenticates the user and writes a short-lived
//! ticket into the shared store; the client presents it in IDENTIFY and the
//! gateway consumes it. Tickets are read and deleted in one step so a ticket
//! can open at most one connection.

use murmur_common::id::{prefix, prefixed_ulid, split_prefixed};
use serde::{Deserialize, Serialize};

use crate::db::kv::KeyValueStore;
use crate::error::ApiError;

/// WS ticket TTL in seconds.
pub const WS_TICKET_TTL_SECS: u64 = 30;

const WS_TICKET_PREFIX: &str = "ws_ticket:";

/// Data stored alongside a WS ticket.
#[derive(Debug, Serialize, Deserialize)]
pub struct WsTicketData {
    pub user_id: String,
}

fn ticket_key(ticket: &str) -> String {
    format!("{WS_TICKET_PREFIX}{ticket}")
}

/// Mint and store a ticket for `user_id`, as the auth service does.
pub async fn issue_ws_ticket(kv: &dyn KeyValueStore, user_id: &str) -> Result<String, ApiError> {
    let ticket = prefixed_ulid(prefix::TICKET);
    let value = serde_json::to_string(&WsTicketData {
        user_id: user_id.to_string(),
    })?;
    kv.set_ex(&ticket_key(&ticket), &value, WS_TICKET_TTL_SECS)
        .await?;
    Ok(ticket)
}

/// Consume a ticket. `Ok(None)` for malformed, unknown or spent tickets.
pub async fn consume_ws_ticket(
    kv: &dyn KeyValueStore,
    ticket: &str,
) -> Result<Option<WsTicketData>, ApiError> {
    if !matches!(split_prefixed(ticket), Some((prefix::TICKET, _))) {
        return Ok(None);
    }
    match kv.get_del(&ticket_key(ticket)).await? {
        Some(v) => {
            let data: WsTicketData =
                serde_json::from_str(&v).map_err(|_| ApiError::internal("corrupt ticket data"))?;
            Ok(Some(data))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::kv::MemoryStore;

    #[tokio::test]
    async fn ticket_is_single_use() {
        let kv = MemoryStore::new();
        let ticket = issue_ws_ticket(&kv, "alice").await.unwrap();
        assert!(ticket.starts_with("wst_"));

        let data = consume_ws_ticket(&kv, &ticket).await.unwrap().unwrap();
        assert_eq!(data.user_id, "alice");
        assert!(consume_ws_ticket(&kv, &ticket).await.unwrap().is_none());
        assert!(consume_ws_ticket(&kv, "wst_unknown").await.unwrap().is_none());

        // Well-formed but never issued.
        let stray = prefixed_ulid(prefix::TICKET);
        assert!(consume_ws_ticket(&kv, &stray).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_ticket_never_reaches_the_store() {
        let kv = MemoryStore::new();
        let ticket = issue_ws_ticket(&kv, "alice").await.unwrap();
        let (_, ulid) = split_prefixed(&ticket).unwrap();

        assert!(consume_ws_ticket(&kv, &format!("conn_{ulid}")).await.unwrap().is_none());
        // The real ticket is still usable.
        assert!(consume_ws_ticket(&kv, &ticket).await.unwrap().is_some());
    }
}
