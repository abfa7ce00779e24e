use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::ApiError;
use crate::models::message::{Message, MessageStatus, NewMessage};
use crate::models::user::UserProfile;

use super::{ChatDirectory, MessageRepository, NotificationRepository};

#[derive(Default)]
struct Records {
    users: HashMap<String, UserProfile>,
    members: HashMap<String, BTreeSet<String>>,
    friends: HashMap<String, BTreeSet<String>>,
    messages: BTreeMap<i64, Message>,
    client_ids: HashMap<String, i64>,
    /// Unread notification count per user.
    unread: HashMap<String, u64>,
    /// Remaining `create_message` calls that fail with an unavailable error.
    failing_creates: u32,
    /// Remaining `user_profile` calls that fail with an unavailable error.
    failing_profiles: u32,
}

impl Records {
    fn recipients(&self, message: &Message) -> usize {
        self.members
            .get(&message.chat_id)
            .map_or(0, |m| m.iter().filter(|u| **u != message.sender_id).count())
    }

    fn refresh_status(&mut self, id: i64) {
        let Some(message) = self.messages.get(&id) else {
            return;
        };
        let projected = MessageStatus::project(
            message.delivered_to.len(),
            message.seen_by.len(),
            self.recipients(message),
        );
        if let Some(message) = self.messages.get_mut(&id) {
            message.status = message.status.max(projected.as_i16());
        }
    }
}

/// In-memory chat directory, message log and notification store for tests
/// and single-process development.
#[derive(Default)]
pub struct MemoryRecords {
    inner: Mutex<Records>,
}

impl MemoryRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, user_id: &str, display_name: &str) {
        self.inner.lock().users.insert(
            user_id.to_string(),
            UserProfile {
                id: user_id.to_string(),
                username: user_id.to_string(),
                display_name: display_name.to_string(),
                avatar_url: None,
            },
        );
    }

    pub fn add_chat(&self, chat_id: &str, members: &[&str]) {
        let mut inner = self.inner.lock();
        let set = inner.members.entry(chat_id.to_string()).or_default();
        set.extend(members.iter().map(|m| m.to_string()));
    }

    /// Record an accepted friendship in both directions.
    pub fn add_friendship(&self, a: &str, b: &str) {
        let mut inner = self.inner.lock();
        inner.friends.entry(a.to_string()).or_default().insert(b.to_string());
        inner.friends.entry(b.to_string()).or_default().insert(a.to_string());
    }

    pub fn add_notifications(&self, user_id: &str, count: u64) {
        *self.inner.lock().unread.entry(user_id.to_string()).or_default() += count;
    }

    /// Make the next `count` inserts fail as if the database were down.
    pub fn fail_next_creates(&self, count: u32) {
        self.inner.lock().failing_creates = count;
    }

    /// Make the next `count` profile lookups fail as if the database were down.
    pub fn fail_next_profiles(&self, count: u32) {
        self.inner.lock().failing_profiles = count;
    }

    pub fn message(&self, id: i64) -> Option<Message> {
        self.inner.lock().messages.get(&id).cloned()
    }

    pub fn messages_in(&self, chat_id: &str) -> Vec<Message> {
        self.inner
            .lock()
            .messages
            .values()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect()
    }

    fn append_with(
        &self,
        ids: &[i64],
        user_id: &str,
        pick: impl Fn(&mut Message) -> &mut Vec<String>,
    ) -> Vec<Message> {
        let mut inner = self.inner.lock();
        let mut changed = Vec::new();
        for id in ids {
            let Some(message) = inner.messages.get_mut(id) else {
                continue;
            };
            let set = pick(message);
            if set.iter().any(|u| u == user_id) {
                continue;
            }
            set.push(user_id.to_string());
            inner.refresh_status(*id);
            if let Some(message) = inner.messages.get(id) {
                changed.push(message.clone());
            }
        }
        changed
    }
}

#[async_trait]
impl ChatDirectory for MemoryRecords {
    async fn chats_for_user(&self, user_id: &str) -> Result<Vec<String>, ApiError> {
        let inner = self.inner.lock();
        let mut chats: Vec<String> = inner
            .members
            .iter()
            .filter(|(_, members)| members.contains(user_id))
            .map(|(chat, _)| chat.clone())
            .collect();
        chats.sort();
        Ok(chats)
    }

    async fn friends_of(&self, user_id: &str) -> Result<Vec<String>, ApiError> {
        let inner = self.inner.lock();
        Ok(inner
            .friends
            .get(user_id)
            .map(|f| f.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn is_member(&self, chat_id: &str, user_id: &str) -> Result<bool, ApiError> {
        let inner = self.inner.lock();
        Ok(inner
            .members
            .get(chat_id)
            .is_some_and(|m| m.contains(user_id)))
    }

    async fn user_profile(&self, user_id: &str) -> Result<Option<UserProfile>, ApiError> {
        let mut inner = self.inner.lock();
        if inner.failing_profiles > 0 {
            inner.failing_profiles -= 1;
            return Err(ApiError::unavailable("Database unavailable"));
        }
        Ok(inner.users.get(user_id).cloned())
    }
}

#[async_trait]
impl MessageRepository for MemoryRecords {
    async fn create_message(&self, message: NewMessage) -> Result<(Message, bool), ApiError> {
        let mut inner = self.inner.lock();
        if inner.failing_creates > 0 {
            inner.failing_creates -= 1;
            return Err(ApiError::unavailable("Database unavailable"));
        }

        if let Some(client_id) = &message.client_id {
            if let Some(id) = inner.client_ids.get(client_id).copied() {
                if let Some(existing) = inner.messages.get(&id) {
                    return Ok((existing.clone(), false));
                }
            }
            inner.client_ids.insert(client_id.clone(), message.id);
        }

        let row = message.into_message();
        inner.messages.insert(row.id, row.clone());
        Ok((row, true))
    }

    async fn find_in_chat_after(
        &self,
        chat_id: &str,
        after_id: i64,
        excluding_sender: &str,
    ) -> Result<Vec<Message>, ApiError> {
        let inner = self.inner.lock();
        Ok(inner
            .messages
            .range(after_id.saturating_add(1)..)
            .map(|(_, m)| m)
            .filter(|m| m.chat_id == chat_id && m.sender_id != excluding_sender)
            .cloned()
            .collect())
    }

    async fn append_delivered(&self, ids: &[i64], user_id: &str) -> Result<Vec<Message>, ApiError> {
        Ok(self.append_with(ids, user_id, |m| &mut m.delivered_to))
    }

    async fn append_seen(&self, ids: &[i64], user_id: &str) -> Result<Vec<Message>, ApiError> {
        Ok(self.append_with(ids, user_id, |m| &mut m.seen_by))
    }
}

#[async_trait]
impl NotificationRepository for MemoryRecords {
    async fn mark_all_read(&self, user_id: &str) -> Result<u64, ApiError> {
        Ok(self.inner.lock().unread.remove(user_id).unwrap_or(0))
    }
}
