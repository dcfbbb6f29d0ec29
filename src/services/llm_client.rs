use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::ports::{ChatCompletion, ChatMessage, ChatUsage, Clock, KvStore, LlmProvider};
use crate::error::PipelineError;
use crate::functions::ratelimiter::RateLimiter;

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Talks to whatever `chat({model, messages, temperature, maxTokens}) →
/// {choices, usage}`-shaped endpoint sits behind `LLM_BASE_URL`. Every call
/// passes through the fixed-window `RateLimiter` first, keyed by a hash of
/// the API key so one tenant's key never starves another's.
pub struct HttpLlmProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_key_hash: String,
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    max_requests_per_min: u32,
}

impl HttpLlmProvider {
    pub fn new(
        base_url: String,
        api_key: String,
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        max_requests_per_min: u32,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");
        let api_key_hash = hex::encode(Sha256::digest(api_key.as_bytes()));
        Self {
            client,
            base_url,
            api_key,
            api_key_hash,
            kv,
            clock,
            max_requests_per_min,
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for HttpLlmProvider {
    async fn chat(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        temperature: f64,
        max_tokens: i32,
    ) -> Result<ChatCompletion, PipelineError> {
        let limiter = RateLimiter {
            kv: self.kv.as_ref(),
            clock: self.clock.as_ref(),
            window_secs: RATE_LIMIT_WINDOW_SECS,
            max_requests: self.max_requests_per_min,
        };
        let check = limiter.check("llm.chat", &self.api_key_hash).await;
        if !check.allowed {
            return Err(PipelineError::rate_limited(
                "llm.chat rate limit exceeded",
                check.retry_after.map(|d| d.as_secs()),
            ));
        }

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "temperature": temperature,
            "max_tokens": max_tokens,
        });

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    PipelineError::Transient(e.to_string())
                } else {
                    PipelineError::Fatal(e.to_string())
                }
            })?;

        classify_and_parse(response).await
    }
}

async fn classify_and_parse(response: reqwest::Response) -> Result<ChatCompletion, PipelineError> {
    let status = response.status();

    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        let body = response.text().await.unwrap_or_default();
        return Err(PipelineError::Authentication(format!(
            "LLM provider rejected credentials: {body}"
        )));
    }

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();
        return Err(PipelineError::rate_limited(
            format!("LLM provider rate limited: {body}"),
            retry_after,
        ));
    }

    if status.is_server_error() {
        let body = response.text().await.unwrap_or_default();
        return Err(PipelineError::Transient(format!(
            "LLM provider returned {status}: {body}"
        )));
    }

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(PipelineError::Validation(format!(
            "LLM provider returned {status}: {body}"
        )));
    }

    let json: serde_json::Value = response
        .json()
        .await
        .map_err(|e| PipelineError::Transient(format!("failed to parse LLM response: {e}")))?;

    let content = json["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| PipelineError::Fatal("LLM response missing message content".to_string()))?
        .trim()
        .to_string();

    let usage = ChatUsage {
        prompt_tokens: json["usage"]["prompt_tokens"].as_i64().unwrap_or(0) as i32,
        completion_tokens: json["usage"]["completion_tokens"].as_i64().unwrap_or(0) as i32,
        total_tokens: json["usage"]["total_tokens"].as_i64().unwrap_or(0) as i32,
    };

    Ok(ChatCompletion { content, usage })
}
