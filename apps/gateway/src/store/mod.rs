//! Persistent collaborators of the realtime core: chat membership and
//! friendship lookups, message persistence, and notifications.
//!
//! Each concern is a trait so the gateway can run against PostgreSQL in
//! production and an in-memory implementation in tests.

pub mod memory;
pub mod pg;

use async_trait::async_trait;

use crate::error::ApiError;
use crate::models::message::{Message, NewMessage};
use crate::models::user::UserProfile;

pub use memory::MemoryRecords;
pub use pg::PgStore;

#[async_trait]
pub trait ChatDirectory: Send + Sync {
    /// Ids of every chat the user is a member of.
    async fn chats_for_user(&self, user_id: &str) -> Result<Vec<String>, ApiError>;
    /// Ids of the user's accepted friends.
    async fn friends_of(&self, user_id: &str) -> Result<Vec<String>, ApiError>;
    async fn is_member(&self, chat_id: &str, user_id: &str) -> Result<bool, ApiError>;
    async fn user_profile(&self, user_id: &str) -> Result<Option<UserProfile>, ApiError>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Persist a message. Idempotent on `client_id`: a retried insert returns
    /// the stored row and `false`.
    async fn create_message(&self, message: NewMessage) -> Result<(Message, bool), ApiError>;

    /// Messages in `chat_id` with id greater than `after_id` that were not
    /// sent by `excluding_sender`, oldest first.
    async fn find_in_chat_after(
        &self,
        chat_id: &str,
        after_id: i64,
        excluding_sender: &str,
    ) -> Result<Vec<Message>, ApiError>;

    /// Add `user_id` to `delivered_to` of each listed message. Returns only
    /// the rows that changed.
    async fn append_delivered(&self, ids: &[i64], user_id: &str) -> Result<Vec<Message>, ApiError>;

    /// Add `user_id` to `seen_by` of each listed message. Returns only the
    /// rows that changed.
    async fn append_seen(&self, ids: &[i64], user_id: &str) -> Result<Vec<Message>, ApiError>;
}

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    /// Mark every unread notification of the user as read. Returns how many changed.
    async fn mark_all_read(&self, user_id: &str) -> Result<u64, ApiError>;
}
