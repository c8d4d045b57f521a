use std::cmp::Ordering;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::models::chunk::ChunkRow;

use super::embeddings::EmbeddingProvider;
use super::similarity::cosine_similarity;
use super::{RetrievalError, DEFAULT_TOP_K};

#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk: ChunkRow,
    pub score: f32,
}

/// Spend attributable to one retrieval, for the cost calculator.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetrievalUsage {
    pub embedding_model: String,
    pub embedding_calls: u32,
    pub embedding_tokens: u32,
    pub candidates_scored: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub chunks: Vec<ScoredChunk>,
    pub usage: RetrievalUsage,
}

/// Scores every candidate that has an embedding and returns the best `k`,
/// highest first. Equal scores keep candidate order.
pub fn rank_top_k(
    query: &[f32],
    candidates: &[ChunkRow],
    k: usize,
) -> Result<Vec<ScoredChunk>, RetrievalError> {
    let mut scored = Vec::with_capacity(candidates.len());
    for chunk in candidates {
        let Some(embedding) = chunk.embedding.as_deref() else {
            continue;
        };
        let score = cosine_similarity(query, embedding)?;
        scored.push(ScoredChunk {
            chunk: chunk.clone(),
            score,
        });
    }

    // sort_by is stable, so ties stay in candidate order
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    scored.truncate(k);
    Ok(scored)
}

#[derive(Clone)]
pub struct RetrievalEngine {
    embedder: Arc<dyn EmbeddingProvider>,
}

impl RetrievalEngine {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { embedder }
    }

    /// Embeds `query` once and ranks `candidates` against it.
    /// Candidates must already be filtered to the caller's scope.
    pub async fn retrieve(
        &self,
        query: &str,
        candidates: &[ChunkRow],
        k: Option<usize>,
    ) -> Result<RetrievalResult, RetrievalError> {
        let batch = self
            .embedder
            .embed(&[query.to_string()])
            .await
            .map_err(|e| RetrievalError::EmbeddingUnavailable(e.to_string()))?;

        let query_vec = batch.vectors.into_iter().next().ok_or_else(|| {
            RetrievalError::EmbeddingUnavailable("provider returned no vector".to_string())
        })?;

        let chunks = rank_top_k(&query_vec, candidates, k.unwrap_or(DEFAULT_TOP_K))?;
        debug!(
            "Retrieved {} of {} candidate chunks",
            chunks.len(),
            candidates.len()
        );

        Ok(RetrievalResult {
            chunks,
            usage: RetrievalUsage {
                embedding_model: self.embedder.model_name().to_string(),
                embedding_calls: 1,
                embedding_tokens: batch.prompt_tokens,
                candidates_scored: candidates.len(),
            },
        })
    }
}
