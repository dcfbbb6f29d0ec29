use super::ports::EmbeddingProvider;
use crate::error::PipelineError;

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
const MAX_INPUT_CHARS: usize = 8000;

/// Talks to whatever `embed({model, input}) → {data:[{embedding}], usage}`
/// endpoint sits behind `LLM_BASE_URL`.
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpEmbeddingProvider {
    pub fn new(base_url: String, api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            base_url,
            api_key,
        }
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, PipelineError> {
        let input = truncate_input(text, MAX_INPUT_CHARS);
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({
                "model": model,
                "input": input,
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    PipelineError::Transient(e.to_string())
                } else {
                    PipelineError::Fatal(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(PipelineError::Authentication(
                "embedding provider rejected credentials".to_string(),
            ));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(PipelineError::rate_limited(
                "embedding provider rate limited",
                retry_after,
            ));
        }
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Transient(format!(
                "embedding provider returned {status}: {body}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Validation(format!(
                "embedding provider returned {status}: {body}"
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PipelineError::Transient(format!("failed to parse embedding response: {e}")))?;

        let vector = json["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| PipelineError::Fatal("embedding response missing data[0].embedding".to_string()))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        Ok(vector)
    }
}

fn truncate_input(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_input_is_noop_under_limit() {
        assert_eq!(truncate_input("short", 100), "short");
    }

    #[test]
    fn truncate_input_cuts_long_text() {
        let long = "a".repeat(200);
        assert_eq!(truncate_input(&long, 100).len(), 100);
    }
}
