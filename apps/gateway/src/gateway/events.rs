//! Gateway opcodes, event types, and wire-format messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_REQUEST: u8 = 4;
pub const OP_ACK: u8 = 5;
pub const OP_HEARTBEAT_ACK: u8 = 6;

// ---------------------------------------------------------------------------
// Server → Client message
// ---------------------------------------------------------------------------

/// A message sent from the server to the client over WebSocket.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    pub d: Value,
}

impl GatewayMessage {
    /// Build a DISPATCH message (op=0).
    pub fn dispatch(event_name: &str, seq: u64, data: Value) -> Self {
        Self {
            op: OP_DISPATCH,
            t: Some(event_name.to_string()),
            s: Some(seq),
            d: data,
        }
    }

    /// Build a HEARTBEAT_ACK message (op=6).
    pub fn heartbeat_ack() -> Self {
        Self {
            op: OP_HEARTBEAT_ACK,
            t: None,
            s: None,
            d: Value::Null,
        }
    }

    /// Build an ACK message (op=5) answering a REQUEST.
    pub fn ack(payload: AckPayload) -> Self {
        Self {
            op: OP_ACK,
            t: None,
            s: None,
            d: serde_json::to_value(payload).unwrap_or(Value::Null),
        }
    }
}

// ---------------------------------------------------------------------------
// Client → Server message
// ---------------------------------------------------------------------------

/// A message received from the client over WebSocket.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    pub op: u8,
    #[serde(default)]
    pub t: Option<String>,
    #[serde(default)]
    pub d: Value,
    /// Correlation id echoed back in the ACK for a REQUEST.
    #[serde(default)]
    pub nonce: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct IdentifyPayload {
    pub ticket: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatPayload {
    pub chat_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SendMessagePayload {
    pub chat_id: String,
    pub content: String,
    /// Client-generated idempotency key, also used to correlate errors.
    #[serde(default)]
    pub client_id: Option<String>,
}

/// Request names carried in `t` of an op=4 message.
pub struct RequestName;

impl RequestName {
    pub const JOIN_CHAT: &'static str = "JOIN_CHAT";
    pub const SEND_MESSAGE: &'static str = "SEND_MESSAGE";
    pub const MARK_DELIVERED: &'static str = "MARK_DELIVERED";
    pub const MARK_SEEN: &'static str = "MARK_SEEN";
    pub const MARK_NOTIFICATIONS_READ: &'static str = "MARK_NOTIFICATIONS_READ";
}

/// A parsed client REQUEST.
#[derive(Debug)]
pub enum ClientRequest {
    JoinChat(ChatPayload),
    SendMessage(SendMessagePayload),
    MarkDelivered,
    MarkSeen(ChatPayload),
    MarkNotificationsRead,
}

impl ClientRequest {
    pub fn parse(name: Option<&str>, data: Value) -> Result<Self, ApiError> {
        let name = name.ok_or_else(|| ApiError::bad_request("Missing request name"))?;
        let payload_error =
            |err: serde_json::Error| ApiError::bad_request(format!("Invalid {name} payload: {err}"));

        match name {
            RequestName::JOIN_CHAT => serde_json::from_value(data)
                .map(Self::JoinChat)
                .map_err(payload_error),
            RequestName::SEND_MESSAGE => serde_json::from_value(data)
                .map(Self::SendMessage)
                .map_err(payload_error),
            RequestName::MARK_DELIVERED => Ok(Self::MarkDelivered),
            RequestName::MARK_SEEN => serde_json::from_value(data)
                .map(Self::MarkSeen)
                .map_err(payload_error),
            RequestName::MARK_NOTIFICATIONS_READ => Ok(Self::MarkNotificationsRead),
            other => Err(ApiError::bad_request(format!("Unknown request: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// ACK payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AckPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// `"ok"` or `"error"`.
    pub status: &'static str,
    pub status_code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl AckPayload {
    pub fn ok(nonce: Option<String>, message: &str, data: Option<Value>) -> Self {
        Self {
            nonce,
            status: "ok",
            status_code: 200,
            message: message.to_string(),
            data,
        }
    }

    pub fn error(nonce: Option<String>, err: &ApiError) -> Self {
        Self {
            nonce,
            status: "error",
            status_code: err.status.as_u16(),
            message: err.message.clone(),
            data: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch event types
// ---------------------------------------------------------------------------

/// Event names dispatched to clients.
pub struct EventName;

impl EventName {
    pub const READY: &'static str = "READY";
    pub const MESSAGE_CREATE: &'static str = "MESSAGE_CREATE";
    pub const STATUS_UPDATE: &'static str = "STATUS_UPDATE";
    pub const MESSAGE_STATUS_UPDATE: &'static str = "MESSAGE_STATUS_UPDATE";
    pub const FRIENDS_STATUS: &'static str = "FRIENDS_STATUS";
    pub const ERROR: &'static str = "ERROR";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_known_requests() {
        let req = ClientRequest::parse(
            Some("SEND_MESSAGE"),
            json!({"chat_id": "c1", "content": "hi", "client_id": "k1"}),
        )
        .unwrap();
        match req {
            ClientRequest::SendMessage(p) => {
                assert_eq!(p.chat_id, "c1");
                assert_eq!(p.client_id.as_deref(), Some("k1"));
            }
            other => panic!("unexpected request: {other:?}"),
        }
        assert!(matches!(
            ClientRequest::parse(Some("MARK_DELIVERED"), Value::Null).unwrap(),
            ClientRequest::MarkDelivered
        ));
    }

    #[test]
    fn rejects_unknown_or_malformed_requests() {
        assert_eq!(ClientRequest::parse(None, Value::Null).unwrap_err().status, 400);
        assert_eq!(
            ClientRequest::parse(Some("DANCE"), Value::Null).unwrap_err().status,
            400
        );
        assert_eq!(
            ClientRequest::parse(Some("MARK_SEEN"), json!({})).unwrap_err().status,
            400
        );
    }

    #[test]
    fn error_ack_carries_status_and_nonce() {
        let ack = AckPayload::error(Some("n1".into()), &ApiError::forbidden("Not a member"));
        let msg = serde_json::to_value(GatewayMessage::ack(ack)).unwrap();
        assert_eq!(msg["op"], OP_ACK);
        assert_eq!(msg["d"]["nonce"], "n1");
        assert_eq!(msg["d"]["status"], "error");
        assert_eq!(msg["d"]["status_code"], 403);
        assert!(msg.get("t").is_none());
    }
}
