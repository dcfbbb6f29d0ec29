use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Narrow collaborator boundaries. Every external dependency the pipeline
/// touches is reached through one of these rather than a concrete client
/// type, so a daemon tick can be driven against a fake in tests.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatUsage {
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub total_tokens: i32,
}

#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub content: String,
    pub usage: ChatUsage,
}

/// Mirrors the `chat`/`embed` port contract: callers get a `PipelineError`
/// already classified into `auth`/`rate_limit`/`transport`/`server` so stage
/// handlers can decide retry vs. terminal failure without re-inspecting a
/// raw HTTP status.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        temperature: f64,
        max_tokens: i32,
    ) -> Result<ChatCompletion, PipelineError>;
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, PipelineError>;
}

/// Outbound message delivery to a tenant's WhatsApp gateway. `base_url` and
/// `api_key` are per-`WaSession`, so callers pass them per call rather than
/// baking a single account into the client.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    async fn send_text(
        &self,
        base_url: &str,
        api_key: &str,
        chat_id: &str,
        text: &str,
    ) -> anyhow::Result<()>;

    async fn send_typing(
        &self,
        base_url: &str,
        api_key: &str,
        chat_id: &str,
        duration_ms: u64,
    ) -> anyhow::Result<()>;
}

/// Distributed key-value store backing the rate limiter and idempotency
/// gate. Fixed-window counters and replay guards both live here so every
/// daemon instance shares the same view regardless of which process handled
/// a given webhook delivery.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn incr_with_expiry(&self, key: &str, ttl_secs: u64) -> anyhow::Result<u64>;
    async fn exists(&self, key: &str) -> anyhow::Result<bool>;
    async fn set(&self, key: &str, ttl_secs: u64) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub chunk_id: uuid::Uuid,
    pub knowledge_base_id: uuid::Uuid,
    pub score: f32,
}

/// The vector index proper: given an embedded query and the set of
/// knowledge bases an agent is bound to, return chunk ids and scores above
/// threshold, best match first. Chunk *text* is hydrated from SQL by the
/// caller, as the spec's retriever keeps those as separate steps.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn query(
        &self,
        kb_weights: &[(uuid::Uuid, f64)],
        query_embedding: &[f32],
        top_k: usize,
        score_threshold: f32,
    ) -> anyhow::Result<Vec<VectorMatch>>;
}

pub trait Crypto: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> anyhow::Result<String>;
    fn decrypt(&self, envelope: &str) -> anyhow::Result<String>;

    /// Verifies `X-Signature` against `hex(HMAC-SHA256(secret, timestamp + "\n" + body))`.
    fn verify_webhook_signature(&self, secret: &str, timestamp: &str, body: &[u8], signature_hex: &str) -> bool;
}
