use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use utoipa::ToSchema;

use crate::db::schema::users;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Sender display fields attached to outgoing message events.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl From<User> for UserProfile {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            display_name: user.display_name,
            avatar_url: user.avatar_url,
        }
    }
}

impl UserProfile {
    /// Placeholder used when the user row is missing; ids are not validated here.
    pub fn unknown(user_id: &str) -> Self {
        Self {
            id: user_id.to_string(),
            username: user_id.to_string(),
            display_name: user_id.to_string(),
            avatar_url: None,
        }
    }
}
