use chrono::{DateTime, Utc};
use forge::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::wa_session::AutoReplyState;

/// One chat within a session. `chat_key = wa_account_id + ":" + remote_chat_id`.
/// `last_turn` is monotonic and must never decrease.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[forge::model]
pub struct Conversation {
    pub id: Uuid,
    pub wa_session_id: Uuid,
    pub chat_key: String,
    pub last_turn: i64,
    pub auto_reply_state: AutoReplyState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn chat_key(wa_account_id: &str, remote_chat_id: &str) -> String {
    format!("{wa_account_id}:{remote_chat_id}")
}
