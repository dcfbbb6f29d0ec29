use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use forge::prelude::*;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::context::AppContext;
use crate::functions::intervention::{self, PunctuationOutcome};
use crate::schema::job::JobPayload;

const IDLE_EVICTION: Duration = Duration::from_secs(600);

enum ActorCmd {
    Append(String),
}

struct ActorHandle {
    tx: mpsc::Sender<ActorCmd>,
}

/// One mailbox per `chatKey`, spawned lazily on first message and evicted
/// after a period of inactivity. Ordering within a chat falls out of the
/// mailbox being a single task; different chats run fully in parallel.
pub struct Coordinator {
    ctx: Arc<AppContext>,
    actors: Arc<Mutex<HashMap<String, ActorHandle>>>,
}

impl Coordinator {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            ctx,
            actors: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn on_inbound_message(
        &self,
        chat_key: &str,
        session_id: Uuid,
        text: &str,
        _message_id: &str,
    ) -> Result<()> {
        let provisional_turn = ensure_conversation_and_peek_turn(&self.ctx.db, session_id, chat_key).await?;

        let message_id = Uuid::new_v4();
        sqlx::query!(
            r#"
            INSERT INTO messages (id, chat_key, turn, role, text, status, ts, created_at)
            VALUES ($1, $2, $3, 'user', $4, 'pending', now(), now())
            "#,
            message_id,
            chat_key,
            provisional_turn,
            text,
        )
        .execute(&self.ctx.db)
        .await
        .map_err(|e| ForgeError::Internal(e.to_string()))?;

        let outcome = intervention::handle_punctuation_control(&self.ctx.db, chat_key, text)
            .await
            .map_err(|e| ForgeError::Internal(e.to_string()))?;

        if outcome != PunctuationOutcome::NoChange {
            write_audit_event(&self.ctx.db, chat_key, &outcome).await?;
            mark_message_completed(&self.ctx.db, message_id).await?;
            return Ok(());
        }

        let allowed = intervention::should_auto_reply(&self.ctx.db, chat_key)
            .await
            .map_err(|e| ForgeError::Internal(e.to_string()))?;
        if !allowed {
            mark_message_suppressed(&self.ctx.db, message_id).await?;
            return Ok(());
        }

        self.dispatch(chat_key.to_string(), text.to_string()).await;
        Ok(())
    }

    async fn dispatch(&self, chat_key: String, text: String) {
        let tx = {
            let mut actors = self.actors.lock().await;
            if let Some(handle) = actors.get(&chat_key) {
                handle.tx.clone()
            } else {
                let (tx, rx) = mpsc::channel(64);
                let ctx = self.ctx.clone();
                let actors_back = self.actors.clone();
                let key = chat_key.clone();
                tokio::spawn(run_actor(ctx, key, rx, actors_back));
                actors.insert(chat_key.clone(), ActorHandle { tx: tx.clone() });
                tx
            }
        };
        if tx.send(ActorCmd::Append(text)).await.is_err() {
            tracing::warn!(chat_key, "chat actor mailbox closed before dispatch");
        }
    }
}

async fn run_actor(
    ctx: Arc<AppContext>,
    chat_key: String,
    mut rx: mpsc::Receiver<ActorCmd>,
    actors: Arc<Mutex<HashMap<String, ActorHandle>>>,
) {
    let merge_window = ctx.config.merge_window;
    let mut buffer: Vec<String> = Vec::new();

    loop {
        if buffer.is_empty() {
            match tokio::time::timeout(IDLE_EVICTION, rx.recv()).await {
                Ok(Some(ActorCmd::Append(text))) => buffer.push(text),
                Ok(None) => break,
                Err(_) => break,
            }
            continue;
        }

        tokio::select! {
            received = rx.recv() => match received {
                Some(ActorCmd::Append(text)) => buffer.push(text),
                None => break,
            },
            _ = tokio::time::sleep(merge_window) => {
                if let Err(err) = flush(&ctx, &chat_key, &mut buffer).await {
                    tracing::error!(error = %err, chat_key, "merge window flush failed");
                }
            }
        }
    }

    actors.lock().await.remove(&chat_key);
}

async fn flush(ctx: &AppContext, chat_key: &str, buffer: &mut Vec<String>) -> anyhow::Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }
    let merged_text = buffer.join(" ");
    buffer.clear();

    let mut tx = ctx.db.begin().await?;
    let row = sqlx::query!(
        "SELECT last_turn FROM conversations WHERE chat_key = $1 FOR UPDATE",
        chat_key
    )
    .fetch_one(&mut *tx)
    .await?;
    let turn = row.last_turn + 1;

    sqlx::query!(
        "UPDATE conversations SET last_turn = $1, updated_at = now() WHERE chat_key = $2",
        turn,
        chat_key
    )
    .execute(&mut *tx)
    .await?;

    let payload = serde_json::to_value(JobPayload::Retrieve { merged_text })?;
    sqlx::query!(
        r#"
        INSERT INTO jobs (id, chat_key, turn, stage, status, payload, attempt_count, created_at, updated_at)
        VALUES ($1, $2, $3, 'retrieve', 'pending', $4, 0, now(), now())
        "#,
        Uuid::new_v4(),
        chat_key,
        turn,
        payload,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

async fn ensure_conversation_and_peek_turn(
    db: &sqlx::PgPool,
    session_id: Uuid,
    chat_key: &str,
) -> Result<i64> {
    let row = sqlx::query!(
        r#"
        INSERT INTO conversations (id, wa_session_id, chat_key, last_turn, auto_reply_state, created_at, updated_at)
        VALUES ($1, $2, $3, 0, 'on', now(), now())
        ON CONFLICT (chat_key) DO UPDATE SET updated_at = conversations.updated_at
        RETURNING last_turn
        "#,
        Uuid::new_v4(),
        session_id,
        chat_key,
    )
    .fetch_one(db)
    .await
    .map_err(|e| ForgeError::Internal(e.to_string()))?;
    Ok(row.last_turn + 1)
}

async fn mark_message_completed(db: &sqlx::PgPool, message_id: Uuid) -> Result<()> {
    sqlx::query!(
        "UPDATE messages SET status = 'completed' WHERE id = $1",
        message_id,
    )
    .execute(db)
    .await
    .map_err(|e| ForgeError::Internal(e.to_string()))?;
    Ok(())
}

async fn mark_message_suppressed(db: &sqlx::PgPool, message_id: Uuid) -> Result<()> {
    sqlx::query!(
        "UPDATE messages SET status = 'suppressed' WHERE id = $1",
        message_id,
    )
    .execute(db)
    .await
    .map_err(|e| ForgeError::Internal(e.to_string()))?;
    Ok(())
}

async fn write_audit_event(db: &sqlx::PgPool, chat_key: &str, outcome: &PunctuationOutcome) -> Result<()> {
    let action = match outcome {
        PunctuationOutcome::Paused => "conversation_paused",
        PunctuationOutcome::Resumed => "conversation_resumed",
        PunctuationOutcome::NoChange => return Ok(()),
    };
    sqlx::query!(
        r#"
        INSERT INTO events (id, trace_id, chat_key, source, action, payload, created_at)
        VALUES ($1, NULL, $2, 'intervention_controller', $3, '{}'::jsonb, now())
        "#,
        Uuid::new_v4(),
        chat_key,
        action,
    )
    .execute(db)
    .await
    .map_err(|e| ForgeError::Internal(e.to_string()))?;
    Ok(())
}
