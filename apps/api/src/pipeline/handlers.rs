use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::video::VideoStatus;
use crate::pipeline::events::PipelineEvent;
use crate::pipeline::recovery::{manual_retry, run_sweep, ManualRetryResponse, SweepSummary};
use crate::pipeline::stages::{run_embedding_stage, EmbeddingStageInput, StageReport};
use crate::pipeline::state_machine::{status_report, StatusReport};
use crate::state::AppState;

/// GET /api/v1/videos/:id/status
pub async fn handle_video_status(
    State(state): State<AppState>,
    Path(video_id): Path<Uuid>,
) -> Result<Json<StatusReport>, AppError> {
    let video = state
        .store
        .get_video(video_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Video {video_id} not found")))?;
    Ok(Json(status_report(&video, Utc::now())))
}

#[derive(Deserialize)]
pub struct ConfirmUploadRequest {
    pub storage_path: String,
}

#[derive(Debug, Serialize)]
pub struct ConfirmUploadResponse {
    pub video_id: Uuid,
    pub status: VideoStatus,
    pub event_id: String,
}

/// POST /api/v1/videos/:id/confirm-upload
/// Called by the client once its own upload finished.
pub async fn handle_confirm_upload(
    State(state): State<AppState>,
    Path(video_id): Path<Uuid>,
    Json(req): Json<ConfirmUploadRequest>,
) -> Result<Json<ConfirmUploadResponse>, AppError> {
    let storage_path = req.storage_path.trim();
    if storage_path.is_empty() {
        return Err(AppError::Validation("storage_path is required".to_string()));
    }

    let video = state
        .store
        .get_video(video_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Video {video_id} not found")))?;

    let exists = state
        .transport
        .object_exists(storage_path)
        .await
        .map_err(|e| AppError::S3(e.to_string()))?;
    if !exists {
        return Err(AppError::Validation(format!(
            "No uploaded object at '{storage_path}'"
        )));
    }

    if !state
        .store
        .begin_processing(video_id, storage_path, Utc::now())
        .await?
    {
        return Err(AppError::Conflict(format!(
            "Video {video_id} is '{}', not awaiting upload",
            video.status
        )));
    }

    let event_id = state
        .dispatcher
        .publish(&PipelineEvent::TranscribeRequested {
            video_id,
            creator_id: video.creator_id,
            storage_path: storage_path.to_string(),
        })
        .await?;

    info!("Upload confirmed for video {video_id}, transcription requested");
    Ok(Json(ConfirmUploadResponse {
        video_id,
        status: VideoStatus::Transcribing,
        event_id,
    }))
}

/// POST /api/v1/videos/:id/retry
pub async fn handle_retry(
    State(state): State<AppState>,
    Path(video_id): Path<Uuid>,
) -> Result<Json<ManualRetryResponse>, AppError> {
    let response = manual_retry(
        state.store.as_ref(),
        state.dispatcher.as_ref(),
        video_id,
        Utc::now(),
    )
    .await?;
    Ok(Json(response))
}

/// POST /api/v1/recovery/sweep
/// Operator- or cron-triggered sweep; the same work the scheduler does.
pub async fn handle_recovery_sweep(
    State(state): State<AppState>,
) -> Result<Json<SweepSummary>, AppError> {
    let summary = run_sweep(
        state.store.as_ref(),
        state.dispatcher.as_ref(),
        &state.config.recovery,
        Utc::now(),
    )
    .await?;
    Ok(Json(summary))
}

#[derive(Debug, Serialize)]
pub struct EventAck {
    pub event: &'static str,
    pub video_id: Uuid,
    pub handled: bool,
    pub report: Option<StageReport>,
}

/// POST /api/v1/events
/// Push delivery from the queue. A non-2xx response makes the queue redeliver.
pub async fn handle_pipeline_event(
    State(state): State<AppState>,
    Json(event): Json<PipelineEvent>,
) -> Result<(StatusCode, Json<EventAck>), AppError> {
    let name = event.name();
    let video_id = event.video_id();

    let input = match event {
        PipelineEvent::EmbeddingsRequested {
            video_id,
            transcript,
            skip_if_exists,
            ..
        } => EmbeddingStageInput {
            video_id,
            transcript,
            skip_if_exists,
        },
        PipelineEvent::ChunksRequested {
            video_id,
            transcript,
            ..
        } => EmbeddingStageInput {
            video_id,
            transcript,
            skip_if_exists: false,
        },
        PipelineEvent::TranscribeRequested { .. } => {
            // consumed by the transcription worker, not this service
            return Ok((
                StatusCode::ACCEPTED,
                Json(EventAck {
                    event: name,
                    video_id,
                    handled: false,
                    report: None,
                }),
            ));
        }
    };

    let report = run_embedding_stage(
        state.store.as_ref(),
        state.embedder.as_ref(),
        &input,
        state.config.chunk_max_chars,
        Utc::now(),
    )
    .await?;

    Ok((
        StatusCode::OK,
        Json(EventAck {
            event: name,
            video_id,
            handled: true,
            report: Some(report),
        }),
    ))
}
