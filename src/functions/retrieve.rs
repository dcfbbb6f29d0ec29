use forge::prelude::*;
use sqlx::PgPool;
use uuid::Uuid;

use crate::context::AppContext;
use crate::error::PipelineError;
use crate::schema::job::{ContextChunk, JobPayload};

const TOP_K: i64 = 8;
const SCORE_THRESHOLD: f32 = 0.7;

struct DraftJob {
    id: Uuid,
    chat_key: String,
    turn: i64,
    payload: serde_json::Value,
    attempt_count: i32,
}

struct KbWeight {
    knowledge_base_id: Uuid,
    weight: f64,
}

struct ChunkTextRow {
    id: Uuid,
    text: String,
}

pub async fn retrieve_tick(ctx: &AppContext) -> anyhow::Result<u32> {
    let jobs = sqlx::query_as!(
        DraftJob,
        r#"
        SELECT id, chat_key, turn, payload, attempt_count
        FROM jobs
        WHERE stage = 'retrieve' AND status = 'pending' AND (next_attempt_at IS NULL OR next_attempt_at <= now())
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
        .map_err(|e| PipelineError::Fatal(format!("invalid retrieve payload: {e}")))?;
    let JobPayload::Retrieve { merged_text } = payload else {
        return Err(PipelineError::Fatal("expected retrieve payload".to_string()));
    };

    let agent_kbs = resolve_agent_knowledge_bases(&ctx.db, &job.chat_key).await?;

    let context = if merged_text.trim().is_empty() || agent_kbs.is_empty() {
        Vec::new()
    } else {
        let embedding = ctx
            .embeddings
            .embed(&ctx.config.embedding_model, &merged_text)
            .await?;
        query_chunks(ctx, &agent_kbs, &embedding).await?
    };

    let next_payload = serde_json::to_value(JobPayload::Infer {
        user_message: merged_text,
        context,
    })
    .map_err(|e| PipelineError::Fatal(e.to_string()))?;

    let mut tx = ctx
        .db
        .begin()
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
        VALUES ($1, $2, $3, 'infer', 'pending', $4, 0, now(), now())
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

async fn resolve_agent_knowledge_bases(db: &PgPool, chat_key: &str) -> Result<Vec<KbWeight>, PipelineError> {
    let rows = sqlx::query_as!(
        KbWeight,
        r#"
        SELECT akb.knowledge_base_id, akb.weight
        FROM conversations c
        JOIN wa_sessions ws ON ws.id = c.wa_session_id
        JOIN agent_knowledge_bases akb ON akb.agent_id = ws.agent_id
        WHERE c.chat_key = $1
        ORDER BY akb.priority ASC
        "#,
        chat_key
    )
    .fetch_all(db)
    .await
    .map_err(|e| PipelineError::Transient(e.to_string()))?;
    Ok(rows)
}

/// Queries the `VectorIndex` port for the top-scoring chunk ids, then
/// hydrates their text from SQL, preserving the order the index returned.
async fn query_chunks(
    ctx: &AppContext,
    agent_kbs: &[KbWeight],
    embedding: &[f32],
) -> Result<Vec<ContextChunk>, PipelineError> {
    let kb_weights: Vec<(Uuid, f64)> = agent_kbs
        .iter()
        .map(|k| (k.knowledge_base_id, k.weight))
        .collect();

    let matches = ctx
        .vector
        .query(&kb_weights, embedding, TOP_K as usize, SCORE_THRESHOLD)
        .await
        .map_err(|e| PipelineError::Transient(e.to_string()))?;

    if matches.is_empty() {
        return Ok(Vec::new());
    }

    let chunk_ids: Vec<Uuid> = matches.iter().map(|m| m.chunk_id).collect();
    let rows = sqlx::query_as!(
        ChunkTextRow,
        "SELECT id, text FROM kb_chunks WHERE id = ANY($1)",
        &chunk_ids,
    )
    .fetch_all(&ctx.db)
    .await
    .map_err(|e| PipelineError::Transient(e.to_string()))?;

    Ok(matches
        .into_iter()
        .filter_map(|m| {
            let text = rows.iter().find(|r| r.id == m.chunk_id)?.text.clone();
            Some(ContextChunk {
                chunk_id: m.chunk_id,
                kb_id: m.knowledge_base_id,
                text,
                score: m.score,
            })
        })
        .collect())
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
        let backoff_secs = 2i64.pow(next_attempt as u32);
        tracing::warn!(%job_id, attempt = next_attempt, error = %err, "retrieve job failed, retrying");
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
        tracing::error!(%job_id, error = %err, "retrieve job failed permanently");
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

#[forge::daemon]
pub async fn retrieve(daemon_ctx: &DaemonContext) -> Result<()> {
    let ctx = crate::context::app_context();
    let poll = ctx.config.retrieve_poll;

    loop {
        tokio::select! {
            _ = daemon_ctx.shutdown_signal() => break,
            _ = tokio::time::sleep(poll) => {
                match retrieve_tick(ctx).await {
                    Ok(n) if n > 0 => tracing::info!(processed = n, "retrieve tick"),
                    Err(e) => tracing::error!(error = %e, "retrieve tick failed"),
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
    fn score_threshold_rejects_distant_chunks() {
        let distance = 0.9f32;
        let score = 1.0 - distance;
        assert!(score < SCORE_THRESHOLD);
    }

    #[test]
    fn score_threshold_accepts_close_chunks() {
        let distance = 0.1f32;
        let score = 1.0 - distance;
        assert!(score >= SCORE_THRESHOLD);
    }
}
