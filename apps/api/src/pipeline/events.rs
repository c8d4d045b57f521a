//! Pipeline events and the dispatcher that publishes them to the durable queue.
//!
//! Delivery is at-least-once with no cross-video ordering, so every consumer
//! must re-derive what to do from persisted artifacts rather than trusting
//! event order.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
pub enum PipelineEvent {
    #[serde(rename = "video/transcribe.requested")]
    TranscribeRequested {
        video_id: Uuid,
        creator_id: Uuid,
        storage_path: String,
    },
    #[serde(rename = "video/chunks.requested")]
    ChunksRequested {
        video_id: Uuid,
        creator_id: Uuid,
        transcript: String,
    },
    #[serde(
        rename = "video/embeddings.requested",
        alias = "video/transcription.completed"
    )]
    EmbeddingsRequested {
        video_id: Uuid,
        creator_id: Uuid,
        transcript: String,
        #[serde(default)]
        skip_if_exists: bool,
    },
}

impl PipelineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::TranscribeRequested { .. } => "video/transcribe.requested",
            PipelineEvent::ChunksRequested { .. } => "video/chunks.requested",
            PipelineEvent::EmbeddingsRequested { .. } => "video/embeddings.requested",
        }
    }

    pub fn video_id(&self) -> Uuid {
        match self {
            PipelineEvent::TranscribeRequested { video_id, .. }
            | PipelineEvent::ChunksRequested { video_id, .. }
            | PipelineEvent::EmbeddingsRequested { video_id, .. } => *video_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Queue rejected event: {0}")]
    Rejected(String),
}

/// Fire-and-acknowledge publishing of pipeline events.
/// Returns the queue-assigned message id once the queue has accepted the event.
#[async_trait]
pub trait EventDispatcher: Send + Sync {
    async fn publish(&self, event: &PipelineEvent) -> Result<String, DispatchError>;
}

/// Publishes events onto a Redis stream consumed by the stage workers.
#[derive(Clone)]
pub struct RedisEventDispatcher {
    client: redis::Client,
    stream: String,
}

impl RedisEventDispatcher {
    pub fn new(client: redis::Client, stream: impl Into<String>) -> Self {
        Self {
            client,
            stream: stream.into(),
        }
    }
}

#[async_trait]
impl EventDispatcher for RedisEventDispatcher {
    async fn publish(&self, event: &PipelineEvent) -> Result<String, DispatchError> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let message_id: String = redis::cmd("XADD")
            .arg(&self.stream)
            .arg("*")
            .arg("name")
            .arg(event.name())
            .arg("video_id")
            .arg(event.video_id().to_string())
            .arg("data")
            .arg(&payload)
            .query_async(&mut conn)
            .await?;

        info!(
            "Published {} for video {} to {} ({})",
            event.name(),
            event.video_id(),
            self.stream,
            message_id
        );
        Ok(message_id)
    }
}
