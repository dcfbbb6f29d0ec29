use chrono::{DateTime, Utc};
use forge::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[forge::forge_enum]
pub enum MessageRole {
    User,
    Assistant,
    Human,
}

#[forge::forge_enum]
pub enum MessageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Suppressed,
}

/// Append-only per-chat record. For a given `(chat_key, turn, role)` the
/// message is logically unique; a user message and the assistant message
/// answering it share a turn.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[forge::model]
pub struct Message {
    pub id: Uuid,
    pub chat_key: String,
    pub turn: i64,
    pub role: MessageRole,
    pub text: String,
    pub status: MessageStatus,
    pub ts: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
