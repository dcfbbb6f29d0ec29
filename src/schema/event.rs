use chrono::{DateTime, Utc};
use forge::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Append-only audit trail entry. Written for every ingress decision,
/// state transition, and send outcome so `trace_id` can reconstruct a
/// full pipeline run end to end.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[forge::model]
pub struct Event {
    pub id: Uuid,
    pub trace_id: Option<Uuid>,
    pub chat_key: Option<String>,
    pub source: String,
    pub action: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
