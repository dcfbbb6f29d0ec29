use forge::prelude::*;
use sqlx::PgPool;
use uuid::Uuid;

use crate::context::AppContext;
use crate::error::PipelineError;
use crate::schema::job::{ContextChunk, JobPayload};
use crate::services::ports::ChatMessage;

const HISTORY_LIMIT: i64 = 20;

struct DraftJob {
    id: Uuid,
    chat_key: String,
    turn: i64,
    payload: serde_json::Value,
    attempt_count: i32,
}

struct AgentRow {
    system_prompt: String,
    model: String,
    temperature: f64,
    max_tokens: i32,
}

struct HistoryRow {
    role: String,
    text: String,
}

pub async fn infer_tick(ctx: &AppContext) -> anyhow::Result<u32> {
    let jobs = sqlx::query_as!(
        DraftJob,
        r#"
        SELECT id, chat_key, turn, payload, attempt_count
        FROM jobs
        WHERE stage = 'infer' AND status = 'pending' AND (next_attempt_at IS NULL OR next_attempt_at <= now())
        ORDER BY turn ASC, created_at ASC
        LIMIT 10
        FOR UPDATE SKIP LOCKED
        "#
    )
    .fetch_all(&ctx.db)
    .await?;

    if jobs.is_empty() {
        return Ok(0);
    }

    let mut processed = 0u32;
    for job in jobs {
        if !claim(&ctx.db, job.id).await? {
            continue;
        }

        match process_one(ctx, &job).await {
            Ok(()) => processed += 1,
            Err(err) => {
                handle_failure(&ctx.db, job.id, job.attempt_count, ctx.config.max_job_attempts, err).await?
            }
        }
    }

    Ok(processed)
}

async fn process_one(ctx: &AppContext, job: &DraftJob) -> Result<(), PipelineError> {
    if !crate::functions::intervention::should_auto_reply(&ctx.db, &job.chat_key)
        .await
        .map_err(|e| PipelineError::Transient(e.to_string()))?
    {
        suppress(&ctx.db, job.id).await?;
        return Ok(());
    }

    let payload: JobPayload = serde_json::from_value(job.payload.clone())
        .map_err(|e| PipelineError::Fatal(format!("invalid infer payload: {e}")))?;
    let JobPayload::Infer { user_message, context } = payload else {
        return Err(PipelineError::Fatal("expected infer payload".to_string()));
    };

    let agent = resolve_agent(&ctx.db, &job.chat_key).await?;
    let history = load_history(&ctx.db, &job.chat_key, job.turn).await?;

    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(build_system_prompt(&agent.system_prompt, &context)));
    for row in history {
        messages.push(match row.role.as_str() {
            "assistant" => ChatMessage::assistant(row.text),
            "human" => ChatMessage::assistant(row.text),
            _ => ChatMessage::user(row.text),
        });
    }
    messages.push(ChatMessage::user(user_message));

    let model = if agent.model.trim().is_empty() {
        ctx.config.llm_default_model.as_str()
    } else {
        agent.model.as_str()
    };
    let completion = ctx
        .llm
        .chat(model, messages, agent.temperature, agent.max_tokens)
        .await?;

    let assistant_message_id = Uuid::new_v4();
    let next_payload = serde_json::to_value(JobPayload::Reply {
        ai_response: completion.content.clone(),
    })
    .map_err(|e| PipelineError::Fatal(e.to_string()))?;

    let mut tx = ctx
        .db
        .begin()
        .await
        .map_err(|e| PipelineError::Transient(e.to_string()))?;

    sqlx::query!(
        r#"
        INSERT INTO messages (id, chat_key, turn, role, text, status, ts, created_at)
        VALUES ($1, $2, $3, 'assistant', $4, 'processing', now(), now())
        "#,
        assistant_message_id,
        job.chat_key,
        job.turn,
        completion.content,
    )
    .execute(&mut *tx)
    .await
    .map_err(|e| PipelineError::Transient(e.to_string()))?;

    sqlx::query!(
        r#"
        INSERT INTO events (id, trace_id, chat_key, source, action, payload, created_at)
        VALUES ($1, NULL, $2, 'inferrer', 'token_usage', $3, now())
        "#,
        Uuid::new_v4(),
        job.chat_key,
        serde_json::json!({
            "prompt_tokens": completion.usage.prompt_tokens,
            "completion_tokens": completion.usage.completion_tokens,
            "total_tokens": completion.usage.total_tokens,
        }),
    )
    .execute(&mut *tx)
    .await
    .map_err(|e| PipelineError::Transient(e.to_string()))?;

    sqlx::query!(
        "UPDATE jobs SET status = 'completed', updated_at = now() WHERE id = $1",
        job.id
    )
    .execute(&mut *tx)
    .await
    .map_err(|e| PipelineError::Transient(e.to_string()))?;

    sqlx::query!(
        r#"
        INSERT INTO jobs (id, chat_key, turn, stage, status, payload, attempt_count, created_at, updated_at)
        VALUES ($1, $2, $3, 'reply', 'pending', $4, 0, now(), now())
        "#,
        Uuid::new_v4(),
        job.chat_key,
        job.turn,
        next_payload,
    )
    .execute(&mut *tx)
    .await
    .map_err(|e| PipelineError::Transient(e.to_string()))?;

    tx.commit().await.map_err(|e| PipelineError::Transient(e.to_string()))?;
    Ok(())
}

fn build_system_prompt(system_prompt: &str, context: &[ContextChunk]) -> String {
    if context.is_empty() {
        return system_prompt.to_string();
    }
    let serialized: Vec<String> = context
        .iter()
        .map(|c| format!("- {}", c.text))
        .collect();
    format!("{system_prompt}\n\nRelevant context:\n{}", serialized.join("\n"))
}

async fn resolve_agent(db: &PgPool, chat_key: &str) -> Result<AgentRow, PipelineError> {
    let row = sqlx::query_as!(
        AgentRow,
        r#"
        SELECT a.system_prompt, a.model, a.temperature, a.max_tokens
        FROM conversations c
        JOIN wa_sessions ws ON ws.id = c.wa_session_id
        JOIN agents a ON a.id = ws.agent_id
        WHERE c.chat_key = $1
        "#,
        chat_key
    )
    .fetch_optional(db)
    .await
    .map_err(|e| PipelineError::Transient(e.to_string()))?;

    row.ok_or_else(|| PipelineError::Fatal(format!("no agent bound for chat {chat_key}")))
}

async fn load_history(db: &PgPool, chat_key: &str, before_turn: i64) -> Result<Vec<HistoryRow>, PipelineError> {
    // Most recent N first so the cap keeps the latest turns, not the
    // earliest ones; reversed below into chronological order for the prompt.
    let mut rows = sqlx::query_as!(
        HistoryRow,
        r#"
        SELECT role::text as "role!", text
        FROM messages
        WHERE chat_key = $1 AND turn < $2 AND status != 'suppressed'
        ORDER BY turn DESC, ts DESC
        LIMIT $3
        "#,
        chat_key,
        before_turn,
        HISTORY_LIMIT,
    )
    .fetch_all(db)
    .await
    .map_err(|e| PipelineError::Transient(e.to_string()))?;
    rows.reverse();
    Ok(rows)
}

async fn claim(db: &PgPool, job_id: Uuid) -> anyhow::Result<bool> {
    let result = sqlx::query!(
        "UPDATE jobs SET status = 'processing', updated_at = now() WHERE id = $1 AND status = 'pending'",
        job_id
    )
    .execute(db)
    .await?;
    Ok(result.rows_affected() == 1)
}

async fn suppress(db: &PgPool, job_id: Uuid) -> Result<(), PipelineError> {
    sqlx::query!(
        "UPDATE jobs SET status = 'suppressed', updated_at = now() WHERE id = $1",
        job_id
    )
    .execute(db)
    .await
    .map_err(|e| PipelineError::Transient(e.to_string()))?;
    Ok(())
}

async fn handle_failure(
    db: &PgPool,
    job_id: Uuid,
    attempt_count: i32,
    max_attempts: u32,
    err: PipelineError,
) -> anyhow::Result<()> {
    let next_attempt = attempt_count + 1;
    if err.retryable() && next_attempt < max_attempts as i32 {
        let backoff_secs = retry_delay_secs(&err, next_attempt);
        tracing::warn!(%job_id, attempt = next_attempt, error = %err, "infer job failed, retrying");
        sqlx::query!(
            r#"
            UPDATE jobs
            SET status = 'pending', attempt_count = $2, error_message = $3,
                next_attempt_at = now() + ($4 || ' seconds')::interval, updated_at = now()
            WHERE id = $1
            "#,
            job_id,
            next_attempt,
            err.to_string(),
            backoff_secs.to_string(),
        )
        .execute(db)
        .await?;
    } else {
        tracing::error!(%job_id, error = %err, "infer job failed permanently");
        sqlx::query!(
            "UPDATE jobs SET status = 'failed', attempt_count = $2, error_message = $3, updated_at = now() WHERE id = $1",
            job_id,
            next_attempt,
            err.to_string(),
        )
        .execute(db)
        .await?;
    }
    Ok(())
}

/// 429 honors the provider's `Retry-After`; every other retryable class
/// backs off exponentially.
fn retry_delay_secs(err: &PipelineError, attempt: i32) -> i64 {
    if let PipelineError::RateLimited { retry_after_secs: Some(secs), .. } = err {
        return (*secs).max(1) as i64;
    }
    2i64.pow(attempt as u32)
}

#[forge::daemon]
pub async fn infer(daemon_ctx: &DaemonContext) -> Result<()> {
    let ctx = crate::context::app_context();
    let poll = ctx.config.infer_poll;

    loop {
        tokio::select! {
            _ = daemon_ctx.shutdown_signal() => break,
            _ = tokio::time::sleep(poll) => {
                match infer_tick(ctx).await {
                    Ok(n) if n > 0 => tracing::info!(processed = n, "infer tick"),
                    Err(e) => tracing::error!(error = %e, "infer tick failed"),
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_with_no_context_is_unchanged() {
        assert_eq!(build_system_prompt("be helpful", &[]), "be helpful");
    }

    #[test]
    fn system_prompt_appends_chunks() {
        let context = vec![ContextChunk {
            chunk_id: Uuid::nil(),
            kb_id: Uuid::nil(),
            text: "refunds take 5 days".to_string(),
            score: 0.9,
        }];
        let prompt = build_system_prompt("be helpful", &context);
        assert!(prompt.contains("refunds take 5 days"));
        assert!(prompt.starts_with("be helpful"));
    }

    #[test]
    fn rate_limited_delay_honors_retry_after() {
        let err = PipelineError::rate_limited("slow down", Some(2));
        assert_eq!(retry_delay_secs(&err, 1), 2);
    }

    #[test]
    fn transient_delay_backs_off_exponentially() {
        let err = PipelineError::Transient("timeout".to_string());
        assert_eq!(retry_delay_secs(&err, 3), 8);
    }
}
