//! Chunk+embed stage handler.
//!
//! Runs when `video/embeddings.requested` (or the older
//! `video/transcription.completed`) is delivered. Delivery is at-least-once and
//! recovery may re-request the same work, so the handler derives what is left
//! to do from persisted chunks and writes every status change conditionally.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::chunk::ChunkRow;
use crate::models::video::VideoStatus;
use crate::pipeline::contract::chunk_transcript;
use crate::pipeline::state_machine::is_terminal;
use crate::pipeline::store::VideoStore;
use crate::retrieval::EmbeddingProvider;

/// Inputs per embeddings request.
const EMBED_BATCH_SIZE: usize = 64;

#[derive(Debug, Clone)]
pub struct EmbeddingStageInput {
    pub video_id: Uuid,
    /// Transcript carried on the event. The stored transcript wins when present.
    pub transcript: String,
    pub skip_if_exists: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    /// Chunks are embedded and the video is now `completed`.
    Completed,
    /// Everything was already embedded; only the status was settled.
    AlreadyDone,
    /// Video is missing, deleted or terminal. Nothing was written.
    Ignored,
    /// The video moved under us (e.g. failed by recovery) before completion.
    Superseded,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub video_id: Uuid,
    pub outcome: StageOutcome,
    pub chunks_created: usize,
    pub chunks_embedded: usize,
    pub embedding_tokens: u32,
}

impl StageReport {
    fn new(video_id: Uuid, outcome: StageOutcome) -> Self {
        Self {
            video_id,
            outcome,
            chunks_created: 0,
            chunks_embedded: 0,
            embedding_tokens: 0,
        }
    }
}

/// Statuses from which the stage may move a video into `to`.
fn earlier_than(to: VideoStatus) -> Vec<VideoStatus> {
    VideoStatus::NON_TERMINAL
        .into_iter()
        .take_while(|s| *s != to)
        .collect()
}

pub async fn run_embedding_stage(
    store: &dyn VideoStore,
    embedder: &dyn EmbeddingProvider,
    input: &EmbeddingStageInput,
    chunk_max_chars: usize,
    now: DateTime<Utc>,
) -> Result<StageReport> {
    let video_id = input.video_id;

    let Some(video) = store.get_video(video_id).await? else {
        warn!("Embedding stage: video {} not found, ignoring", video_id);
        return Ok(StageReport::new(video_id, StageOutcome::Ignored));
    };
    let status = match video.status() {
        Some(s) if !is_terminal(s) => s,
        _ => {
            info!(
                "Embedding stage: video {} is '{}', nothing to do",
                video_id, video.status
            );
            return Ok(StageReport::new(video_id, StageOutcome::Ignored));
        }
    };

    let summary = store
        .artifact_summary(video_id)
        .await?
        .context("video disappeared during embedding stage")?;

    if input.skip_if_exists && summary.all_embedded() {
        let outcome = if store
            .transition_status(video_id, &[status], VideoStatus::Completed, now)
            .await?
        {
            StageOutcome::AlreadyDone
        } else {
            StageOutcome::Superseded
        };
        info!(
            "Embedding stage: video {} already has {} embedded chunks ({:?})",
            video_id, summary.embedded_chunk_count, outcome
        );
        return Ok(StageReport::new(video_id, outcome));
    }

    let mut report = StageReport::new(video_id, StageOutcome::Completed);

    let mut chunks = store.list_chunks(video_id).await?;
    if chunks.is_empty() {
        let stored = video.transcript.as_deref();
        let transcript = match stored.filter(|t| !t.trim().is_empty()) {
            Some(t) => t,
            None if !input.transcript.trim().is_empty() => {
                // keep the artifact recovery reads in step with the chunks
                store
                    .store_transcript(video_id, &input.transcript, now)
                    .await?;
                input.transcript.as_str()
            }
            None if stored.is_some() => "",
            None => bail!("video {video_id} has no transcript stored or delivered"),
        };
        let new_chunks = chunk_transcript(transcript, &video.segments(), chunk_max_chars);

        if new_chunks.is_empty() {
            // trivially empty: nothing to retrieve, but the video is done
            report.outcome = complete(store, video_id, &[status], now).await?;
            info!("Embedding stage: video {} has an empty transcript", video_id);
            return Ok(report);
        }

        chunks = store.insert_chunks(video_id, &new_chunks).await?;
        report.chunks_created = new_chunks.len();
        debug!("Created {} chunks for video {}", new_chunks.len(), video_id);
    }

    // Move forward through processing into embedding. A false result means a
    // concurrent writer already moved it; the final conditioned write decides.
    store
        .transition_status(
            video_id,
            &earlier_than(VideoStatus::Processing),
            VideoStatus::Processing,
            now,
        )
        .await?;
    store
        .transition_status(
            video_id,
            &earlier_than(VideoStatus::Embedding),
            VideoStatus::Embedding,
            now,
        )
        .await?;

    let pending: Vec<&ChunkRow> = chunks.iter().filter(|c| !c.has_embedding()).collect();
    for batch in pending.chunks(EMBED_BATCH_SIZE) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let embedded = embedder
            .embed(&texts)
            .await
            .with_context(|| format!("Embedding request failed for video {video_id}"))?;

        if embedded.vectors.len() != batch.len() {
            bail!(
                "Embedding provider returned {} vectors for {} chunks",
                embedded.vectors.len(),
                batch.len()
            );
        }
        report.embedding_tokens += embedded.prompt_tokens;

        for (chunk, vector) in batch.iter().zip(embedded.vectors) {
            if vector.len() != embedder.dims() {
                bail!(
                    "Embedding for chunk {} has {} dimensions, expected {}",
                    chunk.chunk_index,
                    vector.len(),
                    embedder.dims()
                );
            }
            if store.set_chunk_embedding(chunk.id, &vector).await? {
                report.chunks_embedded += 1;
            }
        }
    }

    report.outcome = complete(store, video_id, &[VideoStatus::Embedding], now).await?;
    info!(
        "Embedding stage for video {}: {:?}, {} created, {} embedded, {} tokens",
        video_id,
        report.outcome,
        report.chunks_created,
        report.chunks_embedded,
        report.embedding_tokens
    );
    Ok(report)
}

async fn complete(
    store: &dyn VideoStore,
    video_id: Uuid,
    from: &[VideoStatus],
    now: DateTime<Utc>,
) -> Result<StageOutcome> {
    if store
        .transition_status(video_id, from, VideoStatus::Completed, now)
        .await?
    {
        Ok(StageOutcome::Completed)
    } else {
        warn!(
            "Video {} changed status before the embedding stage could complete it",
            video_id
        );
        Ok(StageOutcome::Superseded)
    }
}
