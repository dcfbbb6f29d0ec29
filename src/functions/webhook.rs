use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::context::AppContext;
use crate::functions::coordinator::Coordinator;

const REPLAY_WINDOW_SECS: i64 = 300;
const IDEMPOTENCY_TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    event: String,
    data: WebhookEventData,
}

#[derive(Debug, Deserialize)]
struct WebhookEventData {
    message: Option<WebhookMessage>,
}

#[derive(Debug, Deserialize)]
struct WebhookMessage {
    id: String,
    from: String,
    #[serde(default)]
    body: String,
}

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/webhooks/gateway/{session_id}", post(handle_webhook))
        .with_state(coordinator)
}

async fn handle_webhook(
    State(coordinator): State<Arc<Coordinator>>,
    Path(session_id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let ctx = crate::context::app_context();

    let Some(signature) = headers.get("X-Signature").and_then(|v| v.to_str().ok()) else {
        return (StatusCode::UNAUTHORIZED, "missing X-Signature").into_response();
    };
    let Some(timestamp) = headers
        .get("X-Signature-Timestamp")
        .and_then(|v| v.to_str().ok())
    else {
        return (StatusCode::UNAUTHORIZED, "missing X-Signature-Timestamp").into_response();
    };

    let secret = match fetch_webhook_secret(ctx, session_id).await {
        Ok(Some(secret)) => secret,
        Ok(None) => return (StatusCode::NOT_FOUND, "unknown session").into_response(),
        Err(err) => {
            tracing::error!(error = %err, %session_id, "failed to load webhook secret");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let Ok(ts) = timestamp.parse::<i64>() else {
        return (StatusCode::UNAUTHORIZED, "invalid timestamp").into_response();
    };
    let now = ctx.clock.now().timestamp();
    if (now - ts).abs() > REPLAY_WINDOW_SECS {
        return (StatusCode::UNAUTHORIZED, "timestamp out of window").into_response();
    }

    if !ctx
        .crypto
        .verify_webhook_signature(&secret, timestamp, &body, signature)
    {
        return (StatusCode::UNAUTHORIZED, "signature mismatch").into_response();
    }

    // Both guards below only *check* here; they are set after the request is
    // fully handled so a gateway retry following an internal error (5xx)
    // still finds the key absent and is reprocessed, per the spec's failure
    // semantics — a dropped key write must never look like a dropped message.
    let replay_key = format!("replay:{signature}");
    match ctx.kv.exists(&replay_key).await {
        Ok(true) => return Json(serde_json::json!({"success": true})).into_response(),
        Ok(false) => {}
        Err(err) => {
            // fail-open: replay check is best-effort per the error handling design
            tracing::warn!(error = %err, "replay guard KV failure, proceeding");
        }
    }

    let event: WebhookEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(_) => return Json(serde_json::json!({"success": true})).into_response(),
    };

    if event.event != "message" {
        return Json(serde_json::json!({"success": true})).into_response();
    }
    let Some(message) = event.data.message else {
        return Json(serde_json::json!({"success": true})).into_response();
    };

    let idem_key = format!("idem:{session_id}:{}", message.id);
    match ctx.kv.exists(&idem_key).await {
        Ok(true) => return Json(serde_json::json!({"success": true})).into_response(),
        Ok(false) => {}
        Err(err) => {
            tracing::warn!(error = %err, "idempotency guard KV failure, proceeding");
        }
    }

    let chat_key = format!("{session_id}:{}", message.from);
    if let Err(err) = coordinator
        .on_inbound_message(&chat_key, session_id, &message.body, &message.id)
        .await
    {
        tracing::error!(error = %err, %chat_key, "failed to route inbound message");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    if let Err(err) = ctx.kv.set(&replay_key, REPLAY_WINDOW_SECS as u64).await {
        tracing::warn!(error = %err, "failed to set replay guard after success");
    }
    if let Err(err) = ctx.kv.set(&idem_key, IDEMPOTENCY_TTL_SECS).await {
        tracing::warn!(error = %err, "failed to set idempotency guard after success");
    }

    Json(serde_json::json!({"success": true})).into_response()
}

async fn fetch_webhook_secret(ctx: &AppContext, session_id: Uuid) -> anyhow::Result<Option<String>> {
    let row = sqlx::query!(
        "SELECT webhook_secret FROM wa_sessions WHERE id = $1",
        session_id
    )
    .fetch_optional(&ctx.db)
    .await?;
    Ok(row.map(|r| r.webhook_secret))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_message_event_shape() {
        let raw = r#"{"event":"message","data":{"message":{"id":"m1","from":"123","body":"hi"}}}"#;
        let event: WebhookEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.event, "message");
        assert_eq!(event.data.message.unwrap().body, "hi");
    }
}
