use super::ports::GatewayClient;

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

/// Sends to whatever gateway a tenant's `WaSession` points at. The teacher
/// talked to a single embedded WhatsApp client over a process-wide
/// `OnceCell`; a multi-tenant backend has one gateway per session instead,
/// so the base URL and key travel with every call.
pub struct HttpGatewayClient {
    client: reqwest::Client,
}

impl HttpGatewayClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");
        Self { client }
    }
}

impl Default for HttpGatewayClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl GatewayClient for HttpGatewayClient {
    async fn send_text(
        &self,
        base_url: &str,
        api_key: &str,
        chat_id: &str,
        text: &str,
    ) -> anyhow::Result<()> {
        let url = format!("{}/messages", base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {api_key}"))
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({
                "chat_id": chat_id,
                "text": text,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("gateway returned {status}: {body}");
        }
        Ok(())
    }

    async fn send_typing(
        &self,
        base_url: &str,
        api_key: &str,
        chat_id: &str,
        duration_ms: u64,
    ) -> anyhow::Result<()> {
        let url = format!("{}/typing", base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {api_key}"))
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({
                "chat_id": chat_id,
                "duration_ms": duration_ms,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("gateway returned {status}: {body}");
        }
        Ok(())
    }
}
