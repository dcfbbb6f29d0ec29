use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Config;
use crate::services::{
    Clock, Crypto, EmbeddingProvider, GatewayClient, KvStore, LlmProvider, VectorIndex,
};

/// Explicit bag of app-wide collaborators. Unlike the teacher's single
/// `WA_CLIENT` `OnceCell`, every consumer that needs the clock, randomness,
/// or crypto material takes this struct (or a narrower port from it) as an
/// argument rather than reaching for ambient global state.
#[derive(Clone)]
pub struct AppContext {
    pub db: PgPool,
    pub config: Arc<Config>,
    pub clock: Arc<dyn Clock>,
    pub crypto: Arc<dyn Crypto>,
    pub llm: Arc<dyn LlmProvider>,
    pub embeddings: Arc<dyn EmbeddingProvider>,
    pub gateway: Arc<dyn GatewayClient>,
    pub kv: Arc<dyn KvStore>,
    pub vector: Arc<dyn VectorIndex>,
}

impl AppContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: PgPool,
        config: Config,
        clock: Arc<dyn Clock>,
        crypto: Arc<dyn Crypto>,
        llm: Arc<dyn LlmProvider>,
        embeddings: Arc<dyn EmbeddingProvider>,
        gateway: Arc<dyn GatewayClient>,
        kv: Arc<dyn KvStore>,
        vector: Arc<dyn VectorIndex>,
    ) -> Self {
        Self {
            db,
            config: Arc::new(config),
            clock,
            crypto,
            llm,
            embeddings,
            gateway,
            kv,
            vector,
        }
    }
}

static APP_CONTEXT: tokio::sync::OnceCell<AppContext> = tokio::sync::OnceCell::const_new();

/// Daemons registered via `#[forge::daemon]` only take a `&DaemonContext`, so
/// the app-wide collaborators still need one process-global slot to reach
/// them from inside a daemon body. Set once in `main` before any daemon runs.
pub fn set_app_context(ctx: AppContext) {
    APP_CONTEXT
        .set(ctx)
        .unwrap_or_else(|_| panic!("app context already initialized"));
}

pub fn app_context() -> &'static AppContext {
    APP_CONTEXT
        .get()
        .expect("app context not initialized before daemon start")
}
