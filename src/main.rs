use std::sync::Arc;

use forge::prelude::*;
use sqlx::postgres::PgPoolOptions;

mod config;
mod context;
mod error;
mod functions;
mod schema;
mod services;

use config::Config;
use context::AppContext;
use services::crypto::AesGcmCrypto;
use services::embedding_client::HttpEmbeddingProvider;
use services::gateway_client::HttpGatewayClient;
use services::kv::InMemoryKvStore;
use services::llm_client::HttpLlmProvider;
use services::ports::SystemClock;
use services::vector_index::SqlVectorIndex;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env().map_err(|e| ForgeError::Internal(e.to_string()))?;

    let db = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await
        .map_err(|e| ForgeError::Internal(e.to_string()))?;

    let clock: Arc<dyn services::Clock> = Arc::new(SystemClock);
    let kv: Arc<dyn services::KvStore> = Arc::new(InMemoryKvStore::new());
    let crypto: Arc<dyn services::Crypto> = Arc::new(AesGcmCrypto::new(&config.encryption_key));
    let vector: Arc<dyn services::VectorIndex> = Arc::new(SqlVectorIndex::new(db.clone()));
    let llm: Arc<dyn services::LlmProvider> = Arc::new(HttpLlmProvider::new(
        config.llm_base_url.clone(),
        config.llm_api_key.clone(),
        kv.clone(),
        clock.clone(),
        config.rate_limit_per_min,
    ));
    let embeddings: Arc<dyn services::EmbeddingProvider> = Arc::new(HttpEmbeddingProvider::new(
        config.llm_base_url.clone(),
        config.llm_api_key.clone(),
    ));
    let gateway: Arc<dyn services::GatewayClient> = Arc::new(HttpGatewayClient::new());

    let webhook_bind_addr = config.webhook_bind_addr.clone();

    let app_ctx = AppContext::new(
        db, config, clock, crypto, llm, embeddings, gateway, kv, vector,
    );

    let coordinator = Arc::new(functions::coordinator::Coordinator::new(Arc::new(
        app_ctx.clone(),
    )));
    context::set_app_context(app_ctx);

    let webhook_router = functions::webhook::router(coordinator);
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&webhook_bind_addr).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(error = %err, addr = %webhook_bind_addr, "failed to bind webhook listener");
                return;
            }
        };
        tracing::info!(addr = %webhook_bind_addr, "webhook ingress listening");
        if let Err(err) = axum::serve(listener, webhook_router).await {
            tracing::error!(error = %err, "webhook server exited");
        }
    });

    // The retrieve/infer/reply daemons are registered via `#[forge::daemon]`
    // in their own modules and picked up automatically by the forge runtime
    // below; this crate has no query/mutation/cron/workflow surface beyond
    // the webhook route mounted above.
    let forge_config = ForgeConfig::from_file("forge.toml")?;
    let builder = Forge::builder();
    builder.config(forge_config).build()?.run().await
}
