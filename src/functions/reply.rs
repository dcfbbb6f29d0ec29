use forge::prelude::*;
use rand::Rng;
use sqlx::PgPool;
use uuid::Uuid;

use crate::context::AppContext;
use crate::error::PipelineError;
use crate::functions::intervention::safe_trim;
use crate::schema::job::{JobPayload, ReplyResult};

const MAX_SEGMENT_CHARS: usize = 300;
const INTER_SEGMENT_DELAY_MS: u64 = 1000;

struct DraftJob {
    id: Uuid,
    chat_key: String,
    turn: i64,
    payload: serde_json::Value,
    result: Option<serde_json::Value>,
    attempt_count: i32,
}

struct SessionRow {
    gateway_api_url: String,
    gateway_api_key: String,
}

pub async fn reply_tick(ctx: &AppContext) -> anyhow::Result<u32> {
    let jobs = sqlx::query_as!(
        DraftJob,
        r#"
        SELECT id, chat_key, turn, payload, result, attempt_count
        FROM jobs
        WHERE stage = 'reply' AND status = 'pending' AND (next_attempt_at IS NULL OR next_attempt_at <= now())
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
            Err(err) => handle_failure(&ctx.db, &job, ctx.config.max_job_attempts, err).await?,
        }
    }

    Ok(processed)
}

async fn process_one(ctx: &AppContext, job: &DraftJob) -> Result<(), PipelineError> {
    if !crate::functions::intervention::should_auto_reply(&ctx.db, &job.chat_key)
        .await
        .map_err(|e| PipelineError::Transient(e.to_string()))?
    {
        suppress_message(&ctx.db, &job.chat_key, job.turn).await?;
        sqlx::query!(
            "UPDATE jobs SET status = 'suppressed', updated_at = now() WHERE id = $1",
            job.id
        )
        .execute(&ctx.db)
        .await
        .map_err(|e| PipelineError::Transient(e.to_string()))?;
        return Ok(());
    }

    let payload: JobPayload = serde_json::from_value(job.payload.clone())
        .map_err(|e| PipelineError::Fatal(format!("invalid reply payload: {e}")))?;
    let JobPayload::Reply { ai_response } = payload else {
        return Err(PipelineError::Fatal("expected reply payload".to_string()));
    };

    let already_sent: usize = job
        .result
        .as_ref()
        .and_then(|v| serde_json::from_value::<ReplyResult>(v.clone()).ok())
        .map(|r| r.sent_segment_count)
        .unwrap_or(0);

    let trimmed = safe_trim(&ai_response);
    let segments = segment(&trimmed);

    let (session_id, chat_id) = split_chat_key(&job.chat_key)
        .ok_or_else(|| PipelineError::Fatal(format!("malformed chat key {}", job.chat_key)))?;
    let session = resolve_session(&ctx.db, &session_id).await?;
    let api_key = ctx
        .crypto
        .decrypt(&session.gateway_api_key)
        .map_err(|e| PipelineError::Fatal(e.to_string()))?;

    for (i, segment_text) in segments.iter().enumerate().skip(already_sent) {
        let typing_ms = typing_duration_ms(segment_text.chars().count());
        ctx.gateway
            .send_typing(&session.gateway_api_url, &api_key, &chat_id, typing_ms)
            .await
            .map_err(|e| PipelineError::Transient(e.to_string()))?;

        let delay = random_delay_ms(ctx.config.reply_delay_min, ctx.config.reply_delay_max);
        tokio::time::sleep(std::time::Duration::from_millis(delay)).await;

        ctx.gateway
            .send_text(&session.gateway_api_url, &api_key, &chat_id, segment_text)
            .await
            .map_err(|e| PipelineError::Transient(e.to_string()))?;

        record_progress(&ctx.db, job.id, i + 1).await?;

        if i + 1 < segments.len() {
            tokio::time::sleep(std::time::Duration::from_millis(INTER_SEGMENT_DELAY_MS)).await;
        }
    }

    let mut tx = ctx
        .db
        .begin()
        .await
        .map_err(|e| PipelineError::Transient(e.to_string()))?;

    sqlx::query!(
        "UPDATE messages SET status = 'completed' WHERE chat_key = $1 AND turn = $2 AND role = 'assistant'",
        job.chat_key,
        job.turn,
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

    tx.commit().await.map_err(|e| PipelineError::Transient(e.to_string()))?;
    Ok(())
}

/// Splits each response on paragraph breaks, then further on sentence
/// terminators while keeping every piece under the segment cap. Pieces are
/// re-joined greedily up to the cap so a run of short sentences doesn't turn
/// into one message per sentence.
fn segment(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for paragraph in text.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }
        let boundary = out.len();
        for piece in split_sentences(paragraph) {
            push_within_cap(&mut out, boundary, piece);
        }
    }
    if out.is_empty() && !text.trim().is_empty() {
        push_within_cap(&mut out, 0, text.trim());
    }
    out
}

fn split_sentences(paragraph: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = paragraph.as_bytes();
    let mut chars = paragraph.char_indices().peekable();
    while let Some((idx, ch)) = chars.next() {
        if matches!(ch, '.' | '!' | '?') {
            let next_is_space = bytes.get(idx + ch.len_utf8()) == Some(&b' ');
            let is_last = idx + ch.len_utf8() >= bytes.len();
            if next_is_space || is_last {
                let end = idx + ch.len_utf8();
                let sentence = paragraph[start..end].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
                start = end;
            }
        }
    }
    let tail = paragraph[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

/// `boundary` is the index in `out` below which merging is not allowed: it
/// marks where the current paragraph's segments start, so a short sentence
/// never gets glued onto the tail of a previous paragraph.
fn push_within_cap(out: &mut Vec<String>, boundary: usize, piece: &str) {
    let piece_chars = piece.chars().count();
    if piece_chars <= MAX_SEGMENT_CHARS {
        if out.len() > boundary {
            if let Some(last) = out.last_mut() {
                if last.chars().count() + 1 + piece_chars <= MAX_SEGMENT_CHARS {
                    last.push(' ');
                    last.push_str(piece);
                    return;
                }
            }
        }
        out.push(piece.to_string());
        return;
    }
    // Chunk on char boundaries, not bytes, so a >300-char multibyte sentence
    // (CJK included) never gets split mid-codepoint.
    let mut chunk = String::new();
    let mut chunk_len = 0usize;
    for ch in piece.chars() {
        if chunk_len == MAX_SEGMENT_CHARS {
            out.push(std::mem::take(&mut chunk));
            chunk_len = 0;
        }
        chunk.push(ch);
        chunk_len += 1;
    }
    if !chunk.is_empty() {
        out.push(chunk);
    }
}

fn typing_duration_ms(segment_len: usize) -> u64 {
    (40 * segment_len as u64).clamp(1000, 4000)
}

fn random_delay_ms(min: std::time::Duration, max: std::time::Duration) -> u64 {
    let min_ms = min.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    if max_ms <= min_ms {
        return min_ms;
    }
    rand::thread_rng().gen_range(min_ms..=max_ms)
}

fn split_chat_key(chat_key: &str) -> Option<(Uuid, String)> {
    let (session_part, chat_part) = chat_key.split_once(':')?;
    let session_id = Uuid::parse_str(session_part).ok()?;
    Some((session_id, chat_part.to_string()))
}

async fn resolve_session(db: &PgPool, session_id: &Uuid) -> Result<SessionRow, PipelineError> {
    sqlx::query_as!(
        SessionRow,
        "SELECT gateway_api_url, gateway_api_key FROM wa_sessions WHERE id = $1",
        session_id
    )
    .fetch_optional(db)
    .await
    .map_err(|e| PipelineError::Transient(e.to_string()))?
    .ok_or_else(|| PipelineError::Fatal(format!("no session {session_id}")))
}

async fn record_progress(db: &PgPool, job_id: Uuid, sent_segment_count: usize) -> Result<(), PipelineError> {
    let result = serde_json::to_value(ReplyResult { sent_segment_count })
        .map_err(|e| PipelineError::Fatal(e.to_string()))?;
    sqlx::query!(
        "UPDATE jobs SET result = $2, updated_at = now() WHERE id = $1",
        job_id,
        result,
    )
    .execute(db)
    .await
    .map_err(|e| PipelineError::Transient(e.to_string()))?;
    Ok(())
}

async fn suppress_message(db: &PgPool, chat_key: &str, turn: i64) -> Result<(), PipelineError> {
    sqlx::query!(
        "UPDATE messages SET status = 'suppressed' WHERE chat_key = $1 AND turn = $2 AND role = 'assistant'",
        chat_key,
        turn,
    )
    .execute(db)
    .await
    .map_err(|e| PipelineError::Transient(e.to_string()))?;
    Ok(())
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

async fn handle_failure(
    db: &PgPool,
    job: &DraftJob,
    max_attempts: u32,
    err: PipelineError,
) -> anyhow::Result<()> {
    let job_id = job.id;
    let next_attempt = job.attempt_count + 1;
    if err.retryable() && next_attempt < max_attempts as i32 {
        let backoff_secs = 2i64.pow(next_attempt as u32);
        tracing::warn!(%job_id, attempt = next_attempt, error = %err, "reply job failed, retrying");
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
        tracing::error!(%job_id, error = %err, "reply job failed permanently");
        sqlx::query!(
            "UPDATE jobs SET status = 'failed', attempt_count = $2, error_message = $3, updated_at = now() WHERE id = $1",
            job_id,
            next_attempt,
            err.to_string(),
        )
        .execute(db)
        .await?;
        sqlx::query!(
            "UPDATE messages SET status = 'failed' WHERE chat_key = $1 AND turn = $2 AND role = 'assistant' AND status = 'processing'",
            job.chat_key,
            job.turn,
        )
        .execute(db)
        .await?;
    }
    Ok(())
}

#[forge::daemon]
pub async fn reply(daemon_ctx: &DaemonContext) -> Result<()> {
    let ctx = crate::context::app_context();
    let poll = ctx.config.reply_poll;

    loop {
        tokio::select! {
            _ = daemon_ctx.shutdown_signal() => break,
            _ = tokio::time::sleep(poll) => {
                match reply_tick(ctx).await {
                    Ok(n) if n > 0 => tracing::info!(processed = n, "reply tick"),
                    Err(e) => tracing::error!(error = %e, "reply tick failed"),
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
    fn segments_short_text_into_one_piece() {
        let segments = segment("All done");
        assert_eq!(segments, vec!["All done".to_string()]);
    }

    #[test]
    fn segments_split_on_paragraph_breaks() {
        let segments = segment("First part.\n\nSecond part.");
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0], "First part.");
        assert_eq!(segments[1], "Second part.");
    }

    #[test]
    fn segments_respect_the_character_cap() {
        let sentence = "a".repeat(310);
        let text = format!("{sentence}.");
        let segments = segment(&text);
        assert!(segments.iter().all(|s| s.chars().count() <= MAX_SEGMENT_CHARS));
    }

    #[test]
    fn oversized_multibyte_text_splits_on_char_boundaries() {
        let sentence = "日".repeat(310);
        let text = format!("{sentence}。");
        let segments = segment(&text);
        assert!(segments.iter().all(|s| s.chars().count() <= MAX_SEGMENT_CHARS));
        assert!(segments.iter().all(|s| !s.contains('\u{FFFD}')));
        assert_eq!(segments.iter().map(|s| s.chars().count()).sum::<usize>(), 311);
    }

    #[test]
    fn short_sentences_are_combined_up_to_the_cap() {
        let text = "Hi. There. Friend.";
        let segments = segment(text);
        assert_eq!(segments, vec!["Hi. There. Friend.".to_string()]);
    }

    #[test]
    fn typing_duration_is_clamped_between_one_and_four_seconds() {
        assert_eq!(typing_duration_ms(5), 1000);
        assert_eq!(typing_duration_ms(500), 4000);
        assert_eq!(typing_duration_ms(50), 2000);
    }

    #[test]
    fn random_delay_stays_within_bounds() {
        let min = std::time::Duration::from_millis(2000);
        let max = std::time::Duration::from_millis(5000);
        for _ in 0..50 {
            let delay = random_delay_ms(min, max);
            assert!(delay >= 2000 && delay <= 5000);
        }
    }

    #[test]
    fn chat_key_splits_into_session_and_chat_id() {
        let session_id = Uuid::new_v4();
        let chat_key = format!("{session_id}:12345@c.us");
        let (parsed_session, chat_id) = split_chat_key(&chat_key).unwrap();
        assert_eq!(parsed_session, session_id);
        assert_eq!(chat_id, "12345@c.us");
    }
}
