pub mod chat_member;
pub mod message;
pub mod user;
