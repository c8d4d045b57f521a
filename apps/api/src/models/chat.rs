use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A chat session. An empty `video_ids` scope means every completed video the
/// creator owns.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ChatSessionRow {
    pub id: Uuid,
    pub creator_id: Uuid,
    pub title: Option<String>,
    pub video_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}
