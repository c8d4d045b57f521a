//! In-memory [`VideoStore`] for tests.
//!
//! Mirrors the conditional-update semantics of the Postgres store and adds
//! fault injection so sweep isolation can be exercised.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::models::chat::ChatSessionRow;
use crate::models::chunk::{ChunkRow, NewChunk};
use crate::models::video::{LastError, RecoveryAction, VideoRow, VideoStatus};
use crate::pipeline::contract::ArtifactSummary;
use crate::pipeline::state_machine::{is_stuck, is_terminal};

use super::{
    failure_patch, inspection_patch, manual_retry_patch, sweep_order, RecoveryWrite, VideoStore,
};

#[derive(Default)]
pub struct InMemoryVideoStore {
    videos: RwLock<HashMap<Uuid, VideoRow>>,
    chunks: RwLock<Vec<ChunkRow>>,
    sessions: RwLock<HashMap<Uuid, ChatSessionRow>>,
    broken_videos: RwLock<HashSet<Uuid>>,
    selection_down: AtomicBool,
}

/// Top-level JSON merge, the same as Postgres `jsonb || jsonb`.
fn merge(target: &mut Value, patch: Value) {
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let (Some(obj), Value::Object(patch)) = (target.as_object_mut(), patch) {
        for (k, v) in patch {
            obj.insert(k, v);
        }
    }
}

fn recorded_attempts(video: &VideoRow) -> u32 {
    video
        .metadata
        .get("recovery_attempts")
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as u32
}

impl InMemoryVideoStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_video(&self, video: VideoRow) {
        self.videos.write().unwrap().insert(video.id, video);
    }

    pub fn insert_session(&self, session: ChatSessionRow) {
        self.sessions.write().unwrap().insert(session.id, session);
    }

    pub fn add_chunk(&self, video_id: Uuid, text: &str, embedding: Option<Vec<f32>>) -> Uuid {
        let mut chunks = self.chunks.write().unwrap();
        let index = chunks.iter().filter(|c| c.video_id == video_id).count() as i32;
        let id = Uuid::new_v4();
        chunks.push(ChunkRow {
            id,
            video_id,
            chunk_index: index,
            text: text.to_string(),
            embedding,
            start_time: None,
            end_time: None,
            created_at: Utc::now(),
        });
        id
    }

    pub fn video(&self, video_id: Uuid) -> VideoRow {
        self.videos.read().unwrap()[&video_id].clone()
    }

    /// Makes artifact inspection fail for one video.
    pub fn break_video(&self, video_id: Uuid) {
        self.broken_videos.write().unwrap().insert(video_id);
    }

    /// Makes the stuck-video selection query fail.
    pub fn take_selection_down(&self) {
        self.selection_down.store(true, Ordering::SeqCst);
    }

    fn update_if<F>(&self, video_id: Uuid, condition: impl Fn(&VideoRow) -> bool, apply: F) -> bool
    where
        F: FnOnce(&mut VideoRow),
    {
        let mut videos = self.videos.write().unwrap();
        match videos.get_mut(&video_id) {
            Some(video) if !video.is_deleted && condition(video) => {
                apply(video);
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl VideoStore for InMemoryVideoStore {
    async fn get_video(&self, video_id: Uuid) -> Result<Option<VideoRow>> {
        Ok(self
            .videos
            .read()
            .unwrap()
            .get(&video_id)
            .filter(|v| !v.is_deleted)
            .cloned())
    }

    async fn find_stuck_videos(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<VideoRow>> {
        if self.selection_down.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        let mut stuck: Vec<VideoRow> = self
            .videos
            .read()
            .unwrap()
            .values()
            .filter(|v| is_stuck(v, now))
            .cloned()
            .collect();
        stuck.sort_by_key(sweep_order);
        stuck.truncate(limit.max(0) as usize);
        Ok(stuck)
    }

    async fn artifact_summary(&self, video_id: Uuid) -> Result<Option<ArtifactSummary>> {
        if self.broken_videos.read().unwrap().contains(&video_id) {
            bail!("chunk table unavailable for {video_id}");
        }
        let Some(video) = self.videos.read().unwrap().get(&video_id).cloned() else {
            return Ok(None);
        };
        let chunks = self.chunks.read().unwrap();
        let owned: Vec<_> = chunks.iter().filter(|c| c.video_id == video_id).collect();
        Ok(Some(ArtifactSummary {
            has_transcript: video.has_transcript(),
            chunk_count: owned.len() as i64,
            embedded_chunk_count: owned.iter().filter(|c| c.has_embedding()).count() as i64,
        }))
    }

    async fn record_recovery(
        &self,
        video_id: Uuid,
        expected_status: VideoStatus,
        expected_attempts: u32,
        write: &RecoveryWrite,
    ) -> Result<bool> {
        Ok(self.update_if(
            video_id,
            |v| v.status() == Some(expected_status) && recorded_attempts(v) == expected_attempts,
            |v| {
                merge(&mut v.metadata, write.metadata_patch());
                if write.complete {
                    v.status = VideoStatus::Completed.as_str().to_string();
                    v.processing_completed_at = Some(write.at);
                }
                v.updated_at = write.at;
            },
        ))
    }

    async fn record_inspection(
        &self,
        video_id: Uuid,
        expected_status: VideoStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self.update_if(
            video_id,
            |v| v.status() == Some(expected_status),
            |v| merge(&mut v.metadata, inspection_patch(at)),
        ))
    }

    async fn mark_failed(
        &self,
        video_id: Uuid,
        expected_status: VideoStatus,
        error: &LastError,
        action: RecoveryAction,
    ) -> Result<bool> {
        Ok(self.update_if(
            video_id,
            |v| v.status() == Some(expected_status),
            |v| {
                v.status = VideoStatus::Failed.as_str().to_string();
                v.error_message = Some(error.message.clone());
                merge(&mut v.metadata, failure_patch(error, action));
                v.processing_completed_at = Some(error.timestamp);
                v.updated_at = error.timestamp;
            },
        ))
    }

    async fn transition_status(
        &self,
        video_id: Uuid,
        from: &[VideoStatus],
        to: VideoStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self.update_if(
            video_id,
            |v| v.status().map(|s| from.contains(&s)).unwrap_or(false),
            |v| {
                v.status = to.as_str().to_string();
                v.processing_completed_at = is_terminal(to).then_some(now);
                v.updated_at = now;
            },
        ))
    }

    async fn begin_processing(
        &self,
        video_id: Uuid,
        storage_path: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self.update_if(
            video_id,
            |v| matches!(v.status(), Some(VideoStatus::Pending | VideoStatus::Uploading)),
            |v| {
                v.status = VideoStatus::Transcribing.as_str().to_string();
                v.storage_path = Some(storage_path.to_string());
                v.processing_started_at = Some(now);
                v.processing_completed_at = None;
                v.updated_at = now;
            },
        ))
    }

    async fn reset_for_retry(&self, video_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        Ok(self.update_if(
            video_id,
            |v| v.status != VideoStatus::Completed.as_str(),
            |v| {
                v.status = VideoStatus::Transcribing.as_str().to_string();
                v.error_message = None;
                if let Some(obj) = v.metadata.as_object_mut() {
                    obj.remove("last_error");
                }
                merge(&mut v.metadata, manual_retry_patch(now));
                v.processing_started_at = Some(now);
                v.processing_completed_at = None;
                v.updated_at = now;
            },
        ))
    }

    async fn store_transcript(
        &self,
        video_id: Uuid,
        transcript: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self.update_if(
            video_id,
            |v| !v.has_transcript(),
            |v| {
                v.transcript = Some(transcript.to_string());
                v.updated_at = now;
            },
        ))
    }

    async fn list_chunks(&self, video_id: Uuid) -> Result<Vec<ChunkRow>> {
        let mut chunks: Vec<ChunkRow> = self
            .chunks
            .read()
            .unwrap()
            .iter()
            .filter(|c| c.video_id == video_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    async fn insert_chunks(&self, video_id: Uuid, new: &[NewChunk]) -> Result<Vec<ChunkRow>> {
        {
            let mut chunks = self.chunks.write().unwrap();
            for chunk in new {
                let exists = chunks
                    .iter()
                    .any(|c| c.video_id == video_id && c.chunk_index == chunk.chunk_index);
                if !exists {
                    chunks.push(ChunkRow {
                        id: Uuid::new_v4(),
                        video_id,
                        chunk_index: chunk.chunk_index,
                        text: chunk.text.clone(),
                        embedding: None,
                        start_time: chunk.start_time,
                        end_time: chunk.end_time,
                        created_at: Utc::now(),
                    });
                }
            }
        }
        self.list_chunks(video_id).await
    }

    async fn set_chunk_embedding(&self, chunk_id: Uuid, embedding: &[f32]) -> Result<bool> {
        let mut chunks = self.chunks.write().unwrap();
        match chunks.iter_mut().find(|c| c.id == chunk_id) {
            Some(chunk) if chunk.embedding.is_none() => {
                chunk.embedding = Some(embedding.to_vec());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn chunks_for_scope(
        &self,
        creator_id: Uuid,
        video_ids: &[Uuid],
    ) -> Result<Vec<ChunkRow>> {
        let videos = self.videos.read().unwrap();
        let in_scope = |video_id: &Uuid| {
            videos
                .get(video_id)
                .map(|v| {
                    v.creator_id == creator_id
                        && !v.is_deleted
                        && v.status() == Some(VideoStatus::Completed)
                        && (video_ids.is_empty() || video_ids.contains(&v.id))
                })
                .unwrap_or(false)
        };
        Ok(self
            .chunks
            .read()
            .unwrap()
            .iter()
            .filter(|c| c.has_embedding() && in_scope(&c.video_id))
            .cloned()
            .collect())
    }

    async fn get_chat_session(&self, session_id: Uuid) -> Result<Option<ChatSessionRow>> {
        Ok(self.sessions.read().unwrap().get(&session_id).cloned())
    }
}
