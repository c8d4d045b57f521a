use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A transcript segment belonging to one video. `embedding` is null until the
/// embedding stage has run for this row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ChunkRow {
    pub id: Uuid,
    pub video_id: Uuid,
    pub chunk_index: i32,
    pub text: String,
    #[serde(skip_serializing)]
    pub embedding: Option<Vec<f32>>,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl ChunkRow {
    pub fn has_embedding(&self) -> bool {
        self.embedding.as_ref().map(|e| !e.is_empty()).unwrap_or(false)
    }
}

/// A chunk produced by the chunking stage, before it has an id or embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChunk {
    pub chunk_index: i32,
    pub text: String,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
}
