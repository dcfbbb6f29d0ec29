use chrono::{DateTime, Utc};
use forge::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[forge::forge_enum]
pub enum JobStage {
    Retrieve,
    Infer,
    Reply,
}

#[forge::forge_enum]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Suppressed,
}

/// A unit of pipeline work. At most one job per `(chat_key, turn, stage)` may
/// be `pending`/`processing` simultaneously; `suppressed` is terminal.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[forge::model]
pub struct Job {
    pub id: Uuid,
    pub chat_key: String,
    pub turn: i64,
    pub stage: JobStage,
    pub status: JobStatus,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub attempt_count: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub trace_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Chunk of knowledge-base context carried from retrieve into infer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextChunk {
    pub chunk_id: Uuid,
    pub kb_id: Uuid,
    pub text: String,
    pub score: f32,
}

/// Stage-specific payload shapes, opaque `jsonb` in SQL, tagged variants in
/// memory. `stage` on the row picks the variant to deserialize into.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum JobPayload {
    Retrieve { merged_text: String },
    Infer {
        user_message: String,
        context: Vec<ContextChunk>,
    },
    Reply { ai_response: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplyResult {
    pub sent_segment_count: usize,
}
