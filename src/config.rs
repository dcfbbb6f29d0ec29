use std::time::Duration;

/// Centralizes what the teacher's daemons used to read ad hoc via
/// `std::env::var`/`ctx.env_parse`. Kept as a plain struct assembled once at
/// startup and handed down through `AppContext` rather than re-read per tick.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,

    pub encryption_key: String,

    pub llm_base_url: String,
    pub llm_api_key: String,
    pub llm_default_model: String,
    pub embedding_model: String,

    pub merge_window: Duration,

    pub reply_delay_min: Duration,
    pub reply_delay_max: Duration,

    pub rate_limit_per_min: u32,

    pub webhook_bind_addr: String,

    pub retrieve_poll: Duration,
    pub infer_poll: Duration,
    pub reply_poll: Duration,
    pub max_job_attempts: u32,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: require_env("DATABASE_URL")?,

            encryption_key: require_env("ENCRYPTION_KEY")?,

            llm_base_url: std::env::var("LLM_BASE_URL")
                .unwrap_or_else(|_| "https://aihubmix.com/api/v1".to_string()),
            llm_api_key: require_env("LLM_API_KEY")?,
            llm_default_model: std::env::var("LLM_DEFAULT_MODEL")
                .unwrap_or_else(|_| "gpt-3.5-turbo".to_string()),
            embedding_model: std::env::var("EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-ada-002".to_string()),

            merge_window: Duration::from_millis(env_parse("MERGE_WINDOW_MS", 2000)),

            reply_delay_min: Duration::from_millis(env_parse("REPLY_DELAY_MIN_MS", 2000)),
            reply_delay_max: Duration::from_millis(env_parse("REPLY_DELAY_MAX_MS", 5000)),

            rate_limit_per_min: env_parse("RATE_LIMIT_PER_MIN", 60),

            webhook_bind_addr: std::env::var("WEBHOOK_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),

            retrieve_poll: Duration::from_millis(env_parse("WAA_LOOP_POLL_MS_RETRIEVE", 500)),
            infer_poll: Duration::from_millis(env_parse("WAA_LOOP_POLL_MS_INFER", 500)),
            reply_poll: Duration::from_millis(env_parse("WAA_LOOP_POLL_MS_REPLY", 300)),
            max_job_attempts: env_parse("WAA_MAX_JOB_ATTEMPTS", 5),
        })
    }
}

fn require_env(key: &str) -> anyhow::Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("{key} must be set"))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
