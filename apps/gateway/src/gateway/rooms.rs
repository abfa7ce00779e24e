//! Room addressing for fan-out.
//!
//! A room is a named group of connections that receive the same event:
//! every member's sessions join `chat:<id>` for each of their chats, and
//! each session joins its own `user:<id>` room for sender-scoped events.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Room {
    Chat(String),
    User(String),
}

impl Room {
    pub fn chat(id: impl Into<String>) -> Self {
        Self::Chat(id.into())
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::User(id.into())
    }

    /// Parse a `chat:<id>` / `user:<id>` key.
    pub fn parse(key: &str) -> Option<Self> {
        let (kind, id) = key.split_once(':')?;
        if id.is_empty() {
            return None;
        }
        match kind {
            "chat" => Some(Self::chat(id)),
            "user" => Some(Self::user(id)),
            _ => None,
        }
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chat(id) => write!(f, "chat:{id}"),
            Self::User(id) => write!(f, "user:{id}"),
        }
    }
}

impl serde::Serialize for Room {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Room {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let key = String::deserialize(d)?;
        Room::parse(&key).ok_or_else(|| serde::de::Error::custom(format!("invalid room key: {key}")))
    }
}
