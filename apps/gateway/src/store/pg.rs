use async_trait::async_trait;
use diesel::prelude::*;
use diesel::sql_types::{Array, BigInt, Text};

use crate::db::pool::DbPool;
use crate::db::schema::{chat_members, friendships, messages, notifications, users};
use crate::error::ApiError;
use crate::models::chat_member::ChatMember;
use crate::models::message::{Message, NewMessage};
use crate::models::user::{User, UserProfile};

use super::{ChatDirectory, MessageRepository, NotificationRepository};

/// Recipient count of a message: every chat member except the sender.
const RECIPIENTS: &str = "(SELECT COUNT(*) FROM chat_members cm \
     WHERE cm.chat_id = m.chat_id AND cm.user_id <> m.sender_id)";

/// PostgreSQL-backed implementation of every store trait.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn append(
        &self,
        column: &str,
        promoted: i16,
        ids: &[i64],
        user_id: &str,
    ) -> Result<Vec<Message>, ApiError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.pool.get().await?;

        // Status only moves forward; the membership guard keeps the append idempotent.
        let query = format!(
            "UPDATE messages m SET \
                {column} = array_append(m.{column}, $2), \
                status = GREATEST(m.status, CASE \
                    WHEN cardinality(m.{column}) + 1 >= {RECIPIENTS} THEN {promoted} \
                    ELSE 0 END) \
            WHERE m.id = ANY($1) AND NOT ($2 = ANY(m.{column})) \
            RETURNING m.*"
        );

        let mut rows: Vec<Message> = diesel_async::RunQueryDsl::load(
            diesel::sql_query(query)
                .bind::<Array<BigInt>, _>(ids.to_vec())
                .bind::<Text, _>(user_id),
            &mut conn,
        )
        .await?;
        rows.sort_by_key(|m| m.id);
        Ok(rows)
    }
}

#[async_trait]
impl ChatDirectory for PgStore {
    async fn chats_for_user(&self, user_id: &str) -> Result<Vec<String>, ApiError> {
        let mut conn = self.pool.get().await?;
        let memberships: Vec<ChatMember> = diesel_async::RunQueryDsl::load(
            chat_members::table
                .filter(chat_members::user_id.eq(user_id))
                .order(chat_members::chat_id.asc())
                .select(ChatMember::as_select()),
            &mut conn,
        )
        .await?;
        Ok(memberships.into_iter().map(|m| m.chat_id).collect())
    }

    async fn friends_of(&self, user_id: &str) -> Result<Vec<String>, ApiError> {
        let mut conn = self.pool.get().await?;
        let ids = diesel_async::RunQueryDsl::load(
            friendships::table
                .filter(friendships::user_id.eq(user_id))
                .select(friendships::friend_id),
            &mut conn,
        )
        .await?;
        Ok(ids)
    }

    async fn is_member(&self, chat_id: &str, user_id: &str) -> Result<bool, ApiError> {
        let mut conn = self.pool.get().await?;
        let count: i64 = diesel_async::RunQueryDsl::get_result(
            chat_members::table
                .filter(chat_members::chat_id.eq(chat_id))
                .filter(chat_members::user_id.eq(user_id))
                .count(),
            &mut conn,
        )
        .await?;
        Ok(count > 0)
    }

    async fn user_profile(&self, user_id: &str) -> Result<Option<UserProfile>, ApiError> {
        let mut conn = self.pool.get().await?;
        let user: Option<User> = diesel_async::RunQueryDsl::get_result(
            users::table.find(user_id).select(User::as_select()),
            &mut conn,
        )
        .await
        .optional()?;
        Ok(user.map(UserProfile::from))
    }
}

#[async_trait]
impl MessageRepository for PgStore {
    async fn create_message(&self, message: NewMessage) -> Result<(Message, bool), ApiError> {
        let mut conn = self.pool.get().await?;
        let client_id = message.client_id.clone();

        let inserted: Option<Message> = diesel_async::RunQueryDsl::get_result(
            diesel::insert_into(messages::table)
                .values(&message)
                .on_conflict(messages::client_id)
                .do_nothing()
                .returning(Message::as_returning()),
            &mut conn,
        )
        .await
        .optional()?;

        if let Some(row) = inserted {
            return Ok((row, true));
        }

        // Conflict: this client id was already persisted by an earlier attempt.
        let Some(client_id) = client_id else {
            return Err(ApiError::internal("Message insert returned no row"));
        };
        let existing: Message = diesel_async::RunQueryDsl::get_result(
            messages::table
                .filter(messages::client_id.eq(&client_id))
                .select(Message::as_select()),
            &mut conn,
        )
        .await?;
        Ok((existing, false))
    }

    async fn find_in_chat_after(
        &self,
        chat_id: &str,
        after_id: i64,
        excluding_sender: &str,
    ) -> Result<Vec<Message>, ApiError> {
        let mut conn = self.pool.get().await?;
        let rows = diesel_async::RunQueryDsl::load(
            messages::table
                .filter(messages::chat_id.eq(chat_id))
                .filter(messages::id.gt(after_id))
                .filter(messages::sender_id.ne(excluding_sender))
                .order(messages::id.asc())
                .select(Message::as_select()),
            &mut conn,
        )
        .await?;
        Ok(rows)
    }

    async fn append_delivered(&self, ids: &[i64], user_id: &str) -> Result<Vec<Message>, ApiError> {
        self.append("delivered_to", 1, ids, user_id).await
    }

    async fn append_seen(&self, ids: &[i64], user_id: &str) -> Result<Vec<Message>, ApiError> {
        self.append("seen_by", 2, ids, user_id).await
    }
}

#[async_trait]
impl NotificationRepository for PgStore {
    async fn mark_all_read(&self, user_id: &str) -> Result<u64, ApiError> {
        let mut conn = self.pool.get().await?;
        let updated = diesel_async::RunQueryDsl::execute(
            diesel::update(
                notifications::table
                    .filter(notifications::user_id.eq(user_id))
                    .filter(notifications::read.eq(false)),
            )
            .set(notifications::read.eq(true)),
            &mut conn,
        )
        .await?;
        Ok(updated as u64)
    }
}
