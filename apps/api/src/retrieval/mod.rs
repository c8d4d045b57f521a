//! Retrieval engine: ranks already-embedded transcript chunks against a
//! query for chat context.
//!
//! Pure ranking over materialized vectors plus exactly one query-embedding
//! call per retrieval. No retries here; retry policy belongs to the caller.

pub mod embeddings;
pub mod engine;
pub mod similarity;

use thiserror::Error;

pub use embeddings::{EmbeddingBatch, EmbeddingError, EmbeddingProvider, OpenAiEmbeddingClient};
pub use engine::{RetrievalEngine, RetrievalResult, RetrievalUsage, ScoredChunk};

pub const DEFAULT_TOP_K: usize = 3;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Embedding dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },

    #[error("Malformed embedding vector: {0}")]
    MalformedVector(String),
}
