use chrono::{DateTime, Utc};
use forge::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One embedded chunk of a knowledge-base document. `embedding` is a plain
/// Postgres `real[]` array column; `services::vector_index` hydrates it and
/// scores it against a query vector in process, the same brute-force
/// cosine-similarity shape used elsewhere in the retrieval pack.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[forge::model]
pub struct KbChunk {
    pub id: Uuid,
    pub knowledge_base_id: Uuid,
    pub document_id: Uuid,
    pub chunk_index: i32,
    pub text: String,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}
