use chrono::{DateTime, Utc};
use forge::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-tenant LLM configuration. One agent may back many `WaSession`s.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[forge::model]
pub struct Agent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub system_prompt: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Join row binding an agent to one of its knowledge bases. `priority`
/// orders which KB's chunks are preferred on a tie; `weight` scales the
/// vector-similarity score before ranking.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[forge::model]
pub struct AgentKnowledgeBase {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub knowledge_base_id: Uuid,
    pub priority: i32,
    pub weight: f64,
}
