use forge::prelude::*;
use sqlx::PgPool;

use crate::schema::AutoReplyState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunctuationOutcome {
    Paused,
    Resumed,
    NoChange,
}

pub async fn pause_session(db: &PgPool, session_id: uuid::Uuid) -> Result<()> {
    sqlx::query!(
        "UPDATE wa_sessions SET auto_reply_state = 'off', updated_at = now() WHERE id = $1",
        session_id
    )
    .execute(db)
    .await
    .map_err(|e| ForgeError::Internal(e.to_string()))?;
    Ok(())
}

pub async fn resume_session(db: &PgPool, session_id: uuid::Uuid) -> Result<()> {
    sqlx::query!(
        "UPDATE wa_sessions SET auto_reply_state = 'on', updated_at = now() WHERE id = $1",
        session_id
    )
    .execute(db)
    .await
    .map_err(|e| ForgeError::Internal(e.to_string()))?;
    Ok(())
}

/// Last non-whitespace char `,` → pause this conversation; `.` → resume it.
/// ASCII only by design: fullwidth punctuation in CJK text must not trigger.
pub fn classify_punctuation(text: &str) -> PunctuationOutcome {
    match text.trim_end().chars().last() {
        Some(',') => PunctuationOutcome::Paused,
        Some('.') => PunctuationOutcome::Resumed,
        _ => PunctuationOutcome::NoChange,
    }
}

pub async fn handle_punctuation_control(
    db: &PgPool,
    chat_key: &str,
    text: &str,
) -> Result<PunctuationOutcome> {
    let outcome = classify_punctuation(text);
    match outcome {
        PunctuationOutcome::Paused => {
            sqlx::query!(
                "UPDATE conversations SET auto_reply_state = 'off', updated_at = now() WHERE chat_key = $1",
                chat_key
            )
            .execute(db)
            .await
            .map_err(|e| ForgeError::Internal(e.to_string()))?;
        }
        PunctuationOutcome::Resumed => {
            sqlx::query!(
                "UPDATE conversations SET auto_reply_state = 'on', updated_at = now() WHERE chat_key = $1",
                chat_key
            )
            .execute(db)
            .await
            .map_err(|e| ForgeError::Internal(e.to_string()))?;
        }
        PunctuationOutcome::NoChange => {}
    }
    Ok(outcome)
}

/// Session precedence is strict: a paused session suppresses every one of
/// its conversations regardless of the conversation's own toggle.
pub async fn should_auto_reply(db: &PgPool, chat_key: &str) -> Result<bool> {
    let row = sqlx::query!(
        r#"
        SELECT
            ws.auto_reply_state as "session_state: AutoReplyState",
            c.auto_reply_state as "conversation_state: AutoReplyState"
        FROM conversations c
        JOIN wa_sessions ws ON ws.id = c.wa_session_id
        WHERE c.chat_key = $1
        "#,
        chat_key
    )
    .fetch_optional(db)
    .await
    .map_err(|e| ForgeError::Internal(e.to_string()))?;

    let Some(row) = row else {
        return Ok(false);
    };

    Ok(row.session_state.is_on() && row.conversation_state.is_on())
}

/// Strips a single trailing `,` or `.` so the model's own output can never
/// re-trigger a punctuation marker it didn't intend.
pub fn safe_trim(text: &str) -> String {
    match text.chars().last() {
        Some(',') | Some('.') => text[..text.len() - 1].to_string(),
        _ => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comma_marks_paused() {
        assert_eq!(classify_punctuation("taking over,"), PunctuationOutcome::Paused);
    }

    #[test]
    fn full_stop_marks_resumed() {
        assert_eq!(classify_punctuation("resolved."), PunctuationOutcome::Resumed);
    }

    #[test]
    fn no_trailing_marker_is_no_change() {
        assert_eq!(classify_punctuation("all good"), PunctuationOutcome::NoChange);
    }

    #[test]
    fn trailing_whitespace_is_ignored_before_checking() {
        assert_eq!(classify_punctuation("ok,   "), PunctuationOutcome::Paused);
    }

    #[test]
    fn fullwidth_punctuation_does_not_trigger() {
        assert_eq!(classify_punctuation("已处理,"), PunctuationOutcome::Paused);
        assert_eq!(classify_punctuation("已处理。"), PunctuationOutcome::NoChange);
    }

    #[test]
    fn safe_trim_strips_single_trailing_comma_or_period() {
        assert_eq!(safe_trim("All done."), "All done");
        assert_eq!(safe_trim("wait,"), "wait");
    }

    #[test]
    fn safe_trim_is_noop_without_trailing_marker() {
        assert_eq!(safe_trim("All done"), "All done");
    }

    #[test]
    fn safe_trim_only_strips_one_character() {
        assert_eq!(safe_trim("done.."), "done.");
    }
}
