//! Embedding backends and the retrieval-augmented context builder.

pub mod context;
pub mod embeddings;

pub use context::{ContextBuilder, ContextConfig, Enhancement};
pub use embeddings::{
    EmbeddingBackend, EmbeddingError, EmbeddingService, LocalEmbedder, RemoteEmbedder,
};
