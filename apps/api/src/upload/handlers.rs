use std::collections::HashMap;
use std::path::{Path as FsPath, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::video::{VideoRow, VideoStatus};
use crate::pipeline::events::PipelineEvent;
use crate::state::AppState;
use crate::upload::{ChunkedUploader, UploadCallbacks, UploadError, UploadHandle, UploadState};

/// A server-side import of a local file into object storage.
#[derive(Clone)]
pub struct UploadJob {
    pub key: String,
    pub handle: UploadHandle,
    error: Arc<Mutex<Option<String>>>,
    done: Arc<AtomicBool>,
}

impl UploadJob {
    fn new(key: String) -> Self {
        Self {
            key,
            handle: UploadHandle::new(),
            error: Arc::new(Mutex::new(None)),
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    fn set_error(&self, message: String) {
        if let Ok(mut slot) = self.error.lock() {
            *slot = Some(message);
        }
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn error(&self) -> Option<String> {
        self.error.lock().ok().and_then(|e| e.clone())
    }
}

/// Imports in flight or finished, by video id.
#[derive(Clone, Default)]
pub struct UploadRegistry {
    jobs: Arc<Mutex<HashMap<Uuid, UploadJob>>>,
}

impl UploadRegistry {
    /// Registers a new job, dropping finished ones so the map only holds
    /// imports still in flight plus this one.
    fn insert(&self, video_id: Uuid, job: UploadJob) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.retain(|_, j| !j.is_done());
            jobs.insert(video_id, job);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.jobs.lock().map(|j| j.len()).unwrap_or(0)
    }

    pub fn get(&self, video_id: Uuid) -> Option<UploadJob> {
        self.jobs.lock().ok().and_then(|j| j.get(&video_id).cloned())
    }
}

#[derive(Deserialize)]
pub struct ImportRequest {
    pub source_path: String,
}

#[derive(Debug, Serialize)]
pub struct UploadStatusResponse {
    pub video_id: Uuid,
    pub key: String,
    pub state: UploadState,
    pub done: bool,
    pub error: Option<String>,
}

fn status_of(video_id: Uuid, job: &UploadJob) -> UploadStatusResponse {
    UploadStatusResponse {
        video_id,
        key: job.key.clone(),
        state: job.handle.state(),
        done: job.is_done(),
        error: job.error(),
    }
}

/// Canonicalizes `requested` and checks it is a regular file under `root`.
/// Symlinks and `..` are resolved first, so neither can escape the root.
async fn resolve_import_path(
    root: Option<&FsPath>,
    requested: &str,
) -> Result<PathBuf, AppError> {
    let root = root.ok_or_else(|| {
        AppError::Validation("Server-side imports are disabled: IMPORT_ROOT is not set".to_string())
    })?;
    let root = tokio::fs::canonicalize(root)
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("IMPORT_ROOT is unusable: {e}")))?;

    let requested = requested.trim();
    let candidate = if FsPath::new(requested).is_absolute() {
        PathBuf::from(requested)
    } else {
        root.join(requested)
    };
    let not_readable = || AppError::Validation(format!("'{requested}' is not a readable file"));
    let source = tokio::fs::canonicalize(&candidate)
        .await
        .map_err(|_| not_readable())?;

    if !source.starts_with(&root) {
        warn!("Rejected import outside {}: {}", root.display(), requested);
        return Err(AppError::Validation(format!(
            "'{requested}' is outside the import directory"
        )));
    }
    let is_file = tokio::fs::metadata(&source)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);
    if !is_file {
        return Err(not_readable());
    }
    Ok(source)
}

/// POST /api/v1/videos/:id/import
/// Starts uploading a file from the server's disk and returns immediately.
pub async fn handle_import(
    State(state): State<AppState>,
    Path(video_id): Path<Uuid>,
    Json(req): Json<ImportRequest>,
) -> Result<(StatusCode, Json<UploadStatusResponse>), AppError> {
    let source =
        resolve_import_path(state.config.import_root.as_deref(), &req.source_path).await?;

    let video = state
        .store
        .get_video(video_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Video {video_id} not found")))?;

    if !state
        .store
        .transition_status(
            video_id,
            &[VideoStatus::Pending],
            VideoStatus::Uploading,
            Utc::now(),
        )
        .await?
    {
        return Err(AppError::Conflict(format!(
            "Video {video_id} is '{}', not awaiting upload",
            video.status
        )));
    }

    let file_name = source
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("source");
    let key = format!("videos/{}/{}/{}", video.creator_id, video_id, file_name);
    let job = UploadJob::new(key);
    state.upload_jobs.insert(video_id, job.clone());

    info!("Importing {} for video {}", source.display(), video_id);
    let response = status_of(video_id, &job);
    tokio::spawn(run_import(state, video, source, job));

    Ok((StatusCode::ACCEPTED, Json(response)))
}

async fn run_import(state: AppState, video: VideoRow, source: PathBuf, job: UploadJob) {
    let uploader = ChunkedUploader::new(state.transport.clone(), state.config.upload.clone());
    let callbacks = UploadCallbacks {
        on_complete: None,
        on_error: Some(Box::new({
            let job = job.clone();
            move |e: &UploadError| job.set_error(e.to_string())
        })),
    };

    let result = uploader
        .upload_with_callbacks(&source, &job.key, &job.handle, callbacks)
        .await;

    match result {
        Ok(receipt) => {
            if let Err(e) = hand_off(&state, &video, &receipt.key).await {
                error!("Upload of video {} finished but hand-off failed: {e:#}", video.id);
                job.set_error(format!("{e:#}"));
            }
        }
        Err(e) => {
            warn!("Import for video {} did not finish: {}", video.id, e);
            // back to pending so the upload can be started again
            if let Err(revert) = state
                .store
                .transition_status(
                    video.id,
                    &[VideoStatus::Uploading],
                    VideoStatus::Pending,
                    Utc::now(),
                )
                .await
            {
                error!("Failed to reset video {} to pending: {revert:#}", video.id);
            }
        }
    }

    job.done.store(true, Ordering::SeqCst);
}

/// Upload landed: start processing and request transcription.
async fn hand_off(state: &AppState, video: &VideoRow, key: &str) -> anyhow::Result<()> {
    if !state
        .store
        .begin_processing(video.id, key, Utc::now())
        .await?
    {
        anyhow::bail!("video left 'uploading' while the file was being imported");
    }
    state
        .dispatcher
        .publish(&PipelineEvent::TranscribeRequested {
            video_id: video.id,
            creator_id: video.creator_id,
            storage_path: key.to_string(),
        })
        .await?;
    Ok(())
}

fn job_for(state: &AppState, video_id: Uuid) -> Result<UploadJob, AppError> {
    state
        .upload_jobs
        .get(video_id)
        .ok_or_else(|| AppError::NotFound(format!("No upload for video {video_id}")))
}

/// GET /api/v1/videos/:id/upload
pub async fn handle_upload_status(
    State(state): State<AppState>,
    Path(video_id): Path<Uuid>,
) -> Result<Json<UploadStatusResponse>, AppError> {
    let job = job_for(&state, video_id)?;
    Ok(Json(status_of(video_id, &job)))
}

/// POST /api/v1/videos/:id/upload/pause
pub async fn handle_upload_pause(
    State(state): State<AppState>,
    Path(video_id): Path<Uuid>,
) -> Result<Json<UploadStatusResponse>, AppError> {
    let job = job_for(&state, video_id)?;
    job.handle.pause();
    Ok(Json(status_of(video_id, &job)))
}

/// POST /api/v1/videos/:id/upload/resume
pub async fn handle_upload_resume(
    State(state): State<AppState>,
    Path(video_id): Path<Uuid>,
) -> Result<Json<UploadStatusResponse>, AppError> {
    let job = job_for(&state, video_id)?;
    job.handle.resume();
    Ok(Json(status_of(video_id, &job)))
}

/// POST /api/v1/videos/:id/upload/cancel
pub async fn handle_upload_cancel(
    State(state): State<AppState>,
    Path(video_id): Path<Uuid>,
) -> Result<Json<UploadStatusResponse>, AppError> {
    let job = job_for(&state, video_id)?;
    job.handle.cancel();
    Ok(Json(status_of(video_id, &job)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_import_path_must_stay_under_root() {
        let root = tempfile::tempdir().unwrap();
        let inside = root.path().join("stream.mp4");
        std::fs::File::create(&inside)
            .unwrap()
            .write_all(b"frames")
            .unwrap();
        let outside = tempfile::NamedTempFile::new().unwrap();
        let outside_name = outside.path().file_name().unwrap().to_str().unwrap();

        let resolved = resolve_import_path(Some(root.path()), "stream.mp4")
            .await
            .unwrap();
        assert_eq!(resolved, std::fs::canonicalize(&inside).unwrap());

        let escape = format!("../{outside_name}");
        let err = resolve_import_path(Some(root.path()), &escape)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(msg) if msg.contains("outside")));

        let absolute = outside.path().to_str().unwrap();
        assert!(resolve_import_path(Some(root.path()), absolute).await.is_err());
        assert!(resolve_import_path(Some(root.path()), "/etc/passwd")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_import_refused_without_root_or_file() {
        let err = resolve_import_path(None, "anything.mp4").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(msg) if msg.contains("IMPORT_ROOT")));

        let root = tempfile::tempdir().unwrap();
        assert!(resolve_import_path(Some(root.path()), "missing.mp4")
            .await
            .is_err());
        // a directory is not an importable file
        std::fs::create_dir(root.path().join("nested")).unwrap();
        assert!(resolve_import_path(Some(root.path()), "nested")
            .await
            .is_err());
    }

    #[test]
    fn test_registry_drops_finished_jobs_on_insert() {
        let registry = UploadRegistry::default();
        let finished = UploadJob::new("videos/a/1/old.mp4".to_string());
        finished.done.store(true, Ordering::SeqCst);
        let running = UploadJob::new("videos/a/2/live.mp4".to_string());
        let (first, second, third) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        registry.insert(first, finished);
        registry.insert(second, running);
        assert!(registry.get(first).is_none());
        assert_eq!(registry.len(), 1);

        registry.insert(third, UploadJob::new("videos/a/3/next.mp4".to_string()));
        assert!(registry.get(second).is_some());
        assert_eq!(registry.len(), 2);
    }
}
