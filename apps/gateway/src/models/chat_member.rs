use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::db::schema::chat_members;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = chat_members)]
pub struct ChatMember {
    pub chat_id: String,
    pub user_id: String,
    pub joined_at: DateTime<Utc>,
}
