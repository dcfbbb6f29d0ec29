pub mod crypto;
pub mod embedding_client;
pub mod gateway_client;
pub mod kv;
pub mod llm_client;
pub mod ports;
pub mod vector_index;

pub use ports::{
    Clock, Crypto, EmbeddingProvider, GatewayClient, KvStore, LlmProvider, SystemClock,
    VectorIndex, VectorMatch,
};
