//! Per-connection gateway session state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use super::rooms::Room;

/// State for a single WebSocket connection.
pub struct GatewaySession {
    /// Unique connection identifier (`conn_` prefixed ULID).
    pub connection_id: String,
    /// Authenticated user ID.
    pub user_id: String,
    /// Rooms this connection receives events for. Grows on JOIN_CHAT.
    rooms: RwLock<HashSet<Room>>,
    /// Monotonically increasing sequence number for dispatch events.
    seq: AtomicU64,
}

impl GatewaySession {
    /// A fresh session is always in its own user room.
    pub fn new(connection_id: String, user_id: String) -> Self {
        let rooms = HashSet::from([Room::user(user_id.clone())]);
        Self {
            connection_id,
            user_id,
            rooms: RwLock::new(rooms),
            seq: AtomicU64::new(0),
        }
    }

    /// Get the next sequence number for a dispatch event.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Join a room. Returns `false` if already joined.
    pub fn join(&self, room: Room) -> bool {
        self.rooms.write().insert(room)
    }

    pub fn is_subscribed(&self, room: &Room) -> bool {
        self.rooms.read().contains(room)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_own_user_room() {
        let session = GatewaySession::new("conn_1".into(), "alice".into());
        assert!(session.is_subscribed(&Room::user("alice")));
        assert!(!session.is_subscribed(&Room::user("bob")));
        assert!(session.join(Room::chat("c1")));
        assert!(!session.join(Room::chat("c1")));
        assert_eq!(session.room_count(), 2);
    }

    #[test]
    fn seq_increments() {
        let session = GatewaySession::new("conn_1".into(), "alice".into());
        assert_eq!(session.next_seq(), 1);
        assert_eq!(session.next_seq(), 2);
    }
}
