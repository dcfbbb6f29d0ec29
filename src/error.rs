use thiserror::Error;

/// Typed failure taxonomy for the pipeline. `retryable()` drives whether a
/// job gets `next_attempt_at` bumped or is marked `failed` outright.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("rate limited: {message} (retry after {retry_after_secs:?}s)")]
    RateLimited {
        message: String,
        retry_after_secs: Option<u64>,
    },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("fatal failure: {0}")]
    Fatal(String),
}

impl PipelineError {
    pub fn retryable(&self) -> bool {
        matches!(self, PipelineError::Transient(_) | PipelineError::RateLimited { .. })
    }

    pub fn rate_limited(message: impl Into<String>, retry_after_secs: Option<u64>) -> Self {
        PipelineError::RateLimited {
            message: message.into(),
            retry_after_secs,
        }
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        PipelineError::Transient(err.to_string())
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            PipelineError::Transient(err.to_string())
        } else {
            PipelineError::Fatal(err.to_string())
        }
    }
}
