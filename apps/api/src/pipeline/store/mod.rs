//! Artifact store accessors for videos, chunks and chat sessions.
//!
//! Every status or metadata mutation is a single statement keyed by video id
//! and conditioned on the status the caller last observed, so a late stage
//! completion and a recovery sweep can't both win. A `false` return means the
//! condition didn't hold and nothing was written.

#[cfg(test)]
pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::models::chat::ChatSessionRow;
use crate::models::chunk::{ChunkRow, NewChunk};
use crate::models::video::{LastError, RecoveryAction, VideoRow, VideoStatus};
use crate::pipeline::contract::ArtifactSummary;
use crate::pipeline::state_machine::stage_clock;

pub use postgres::PgVideoStore;

/// Recovery bookkeeping written atomically with the decision that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryWrite {
    pub attempts: u32,
    pub at: DateTime<Utc>,
    pub action: RecoveryAction,
    /// Also move the video to `completed` and stamp `processing_completed_at`.
    pub complete: bool,
}

impl RecoveryWrite {
    pub fn metadata_patch(&self) -> Value {
        json!({
            "recovery_attempts": self.attempts,
            "last_recovery_attempt": self.at,
            "last_recovery_action": self.action,
        })
    }
}

pub(crate) fn failure_patch(error: &LastError, action: RecoveryAction) -> Value {
    json!({
        "last_error": error,
        "last_recovery_attempt": error.timestamp,
        "last_recovery_action": action,
    })
}

/// Marks that the sweep looked at a video it could not act on.
pub(crate) fn inspection_patch(at: DateTime<Utc>) -> Value {
    json!({ "last_recovery_attempt": at })
}

/// Sweep selection order: never-attempted videos first, then the least
/// recently attempted, then the longest stuck. Matches `NULLS FIRST` on
/// `last_recovery_attempt` in the Postgres query.
pub(crate) fn sweep_order(video: &VideoRow) -> (Option<DateTime<Utc>>, DateTime<Utc>) {
    let last_attempt = video
        .processing_metadata()
        .ok()
        .and_then(|m| m.last_recovery_attempt);
    (last_attempt, stage_clock(video))
}

pub(crate) fn manual_retry_patch(at: DateTime<Utc>) -> Value {
    json!({
        "recovery_attempts": 0,
        "last_recovery_attempt": at,
        "last_recovery_action": RecoveryAction::ManualRetry,
    })
}

#[async_trait]
pub trait VideoStore: Send + Sync {
    async fn get_video(&self, video_id: Uuid) -> Result<Option<VideoRow>>;

    /// Live, non-terminal videos whose time in stage exceeds the stage
    /// timeout, in [`sweep_order`], at most `limit` rows. Rows the sweep has
    /// already touched go to the back so they can't crowd out the rest.
    async fn find_stuck_videos(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<VideoRow>>;

    async fn artifact_summary(&self, video_id: Uuid) -> Result<Option<ArtifactSummary>>;

    /// Writes recovery bookkeeping if the video is still in `expected_status`
    /// and nobody else has recorded an attempt since `expected_attempts`.
    async fn record_recovery(
        &self,
        video_id: Uuid,
        expected_status: VideoStatus,
        expected_attempts: u32,
        write: &RecoveryWrite,
    ) -> Result<bool>;

    /// Stamps `last_recovery_attempt` without spending an attempt or moving
    /// the status. Used when the sweep finds nothing safe to do.
    async fn record_inspection(
        &self,
        video_id: Uuid,
        expected_status: VideoStatus,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Moves the video to `failed`, recording `error` in metadata and in
    /// `error_message`.
    async fn mark_failed(
        &self,
        video_id: Uuid,
        expected_status: VideoStatus,
        error: &LastError,
        action: RecoveryAction,
    ) -> Result<bool>;

    /// Moves the video to `to` if its status is one of `from`. Terminal
    /// targets stamp `processing_completed_at`; non-terminal ones clear it.
    async fn transition_status(
        &self,
        video_id: Uuid,
        from: &[VideoStatus],
        to: VideoStatus,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Upload confirmed: record the storage location and start processing.
    async fn begin_processing(
        &self,
        video_id: Uuid,
        storage_path: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Operator retry: back to `transcribing` with a fresh attempt budget.
    async fn reset_for_retry(&self, video_id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Saves a transcript delivered on an event, only if none is stored yet.
    async fn store_transcript(
        &self,
        video_id: Uuid,
        transcript: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn list_chunks(&self, video_id: Uuid) -> Result<Vec<ChunkRow>>;

    /// Inserts chunks, ignoring indices that already exist, and returns the
    /// video's full chunk list.
    async fn insert_chunks(&self, video_id: Uuid, chunks: &[NewChunk]) -> Result<Vec<ChunkRow>>;

    /// Sets a chunk's embedding once. Returns false if it already had one.
    async fn set_chunk_embedding(&self, chunk_id: Uuid, embedding: &[f32]) -> Result<bool>;

    /// Embedded chunks for a chat scope. An empty `video_ids` means every
    /// completed video owned by `creator_id`.
    async fn chunks_for_scope(&self, creator_id: Uuid, video_ids: &[Uuid])
        -> Result<Vec<ChunkRow>>;

    async fn get_chat_session(&self, session_id: Uuid) -> Result<Option<ChatSessionRow>>;
}
