use chrono::{DateTime, Utc};
use forge::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[forge::forge_enum]
pub enum SessionStatus {
    Connecting,
    ScanQr,
    Working,
    Failed,
    Stopped,
}

#[forge::forge_enum]
pub enum AutoReplyState {
    On,
    Off,
}

/// A tenant-owned binding to one WhatsApp account. `wa_account_id` is the
/// externally meaningful identity; `id` only ever appears in foreign keys.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[forge::model]
pub struct WaSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub wa_account_id: String,
    pub agent_id: Option<Uuid>,
    pub gateway_api_url: String,
    /// Envelope-encrypted at rest; see `services::crypto`.
    pub gateway_api_key: String,
    pub webhook_secret: String,
    pub status: SessionStatus,
    pub auto_reply_state: AutoReplyState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AutoReplyState {
    pub fn is_on(&self) -> bool {
        matches!(self, AutoReplyState::On)
    }
}
