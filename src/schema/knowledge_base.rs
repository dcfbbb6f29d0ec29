use chrono::{DateTime, Utc};
use forge::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[forge::forge_enum]
pub enum DocumentStatus {
    Pending,
    Chunked,
    Failed,
}

/// A named collection of documents an `Agent` can be bound to. Ingestion
/// (file parsing, chunking, embedding) happens upstream of this core; this
/// row and its `Document`/`KbChunk` children are the part the pipeline owns.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[forge::model]
pub struct KnowledgeBase {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One ingested source file. `status` reflects whatever upstream ingestion
/// collaborator produced the chunk rows; this core only reads it to decide
/// whether a document's chunks are eligible for retrieval.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[forge::model]
pub struct Document {
    pub id: Uuid,
    pub knowledge_base_id: Uuid,
    pub filename: String,
    pub status: DocumentStatus,
    pub created_at: DateTime<Utc>,
}
