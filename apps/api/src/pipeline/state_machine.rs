//! Video state machine: pure functions over a video snapshot.
//!
//! Nothing here touches the database or the clock; callers pass `now` in.
//! Progress and ETA are for display only and never drive control flow.
//! Status values that don't parse render as an "unknown" stage instead of
//! erroring, because the column is persisted and may predate an enum change.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::video::{ProcessingMetadata, VideoRow, VideoStatus};

// ────────────────────────────────────────────────────────────────────────────
// Static stage tables
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageMetadata {
    pub name: &'static str,
    pub description: &'static str,
    /// Whether an operator may retry from this stage. Automatic retry is a
    /// recovery sweep decision, not implied by this flag.
    pub retryable: bool,
    /// Minutes a video may sit in this stage before the recovery sweep picks
    /// it up. `None` for terminal stages.
    pub timeout_minutes: Option<i64>,
}

pub const UNKNOWN_STAGE: StageMetadata = StageMetadata {
    name: "unknown",
    description: "Unknown stage",
    retryable: false,
    timeout_minutes: None,
};

pub fn progress(status: VideoStatus) -> u8 {
    match status {
        VideoStatus::Pending => 0,
        VideoStatus::Uploading => 10,
        VideoStatus::Transcribing => 30,
        VideoStatus::Processing => 50,
        VideoStatus::Embedding => 70,
        VideoStatus::Completed => 100,
        VideoStatus::Failed => 0,
    }
}

pub fn is_terminal(status: VideoStatus) -> bool {
    matches!(status, VideoStatus::Completed | VideoStatus::Failed)
}

pub fn stage_metadata(status: VideoStatus) -> StageMetadata {
    match status {
        VideoStatus::Pending => StageMetadata {
            name: "pending",
            description: "Waiting for upload to start",
            retryable: true,
            timeout_minutes: Some(24 * 60),
        },
        VideoStatus::Uploading => StageMetadata {
            name: "uploading",
            description: "Uploading video file",
            retryable: true,
            timeout_minutes: Some(120),
        },
        VideoStatus::Transcribing => StageMetadata {
            name: "transcribing",
            description: "Transcribing audio to text",
            retryable: true,
            timeout_minutes: Some(60),
        },
        VideoStatus::Processing => StageMetadata {
            name: "processing",
            description: "Splitting transcript into chunks",
            retryable: true,
            timeout_minutes: Some(30),
        },
        VideoStatus::Embedding => StageMetadata {
            name: "embedding",
            description: "Generating embeddings for search",
            retryable: true,
            timeout_minutes: Some(30),
        },
        VideoStatus::Completed => StageMetadata {
            name: "completed",
            description: "Ready for chat",
            retryable: false,
            timeout_minutes: None,
        },
        VideoStatus::Failed => StageMetadata {
            name: "failed",
            description: "Processing failed",
            retryable: false,
            timeout_minutes: None,
        },
    }
}

/// Expected wall-clock minutes a healthy video spends in each stage.
fn expected_minutes(status: VideoStatus) -> i64 {
    match status {
        VideoStatus::Pending => 0,
        VideoStatus::Uploading => 5,
        VideoStatus::Transcribing => 10,
        VideoStatus::Processing => 2,
        VideoStatus::Embedding => 3,
        VideoStatus::Completed | VideoStatus::Failed => 0,
    }
}

pub fn next_steps(status: Option<VideoStatus>) -> Vec<String> {
    let steps: &[&str] = match status {
        Some(VideoStatus::Pending) => &["Upload your video file to begin processing"],
        Some(VideoStatus::Uploading) => &["Keep this page open until the upload finishes"],
        Some(VideoStatus::Transcribing) => {
            &["Your audio is being transcribed, this usually takes a few minutes"]
        }
        Some(VideoStatus::Processing) => &["The transcript is being split into searchable sections"],
        Some(VideoStatus::Embedding) => &["Almost done: your video is being indexed for chat"],
        Some(VideoStatus::Completed) => &[
            "Start a chat about this video",
            "Review the transcript for accuracy",
        ],
        Some(VideoStatus::Failed) => &[
            "Check the error details",
            "Retry processing from the video page",
            "Contact support if the problem persists",
        ],
        None => &[
            "Refresh the page",
            "Contact support if this status persists",
        ],
    };
    steps.iter().map(|s| s.to_string()).collect()
}

// ────────────────────────────────────────────────────────────────────────────
// Time derivations
// ────────────────────────────────────────────────────────────────────────────

/// Minutes left until completion, estimated from time since processing began.
/// `None` for terminal statuses or when processing hasn't started.
pub fn estimated_time_remaining(
    status: VideoStatus,
    processing_started_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<i64> {
    if is_terminal(status) {
        return None;
    }
    let started = processing_started_at?;
    let elapsed = (now - started).num_minutes().max(0);

    let total: i64 = VideoStatus::NON_TERMINAL.iter().map(|s| expected_minutes(*s)).sum();
    let after_current: i64 = VideoStatus::NON_TERMINAL
        .iter()
        .skip_while(|s| **s != status)
        .skip(1)
        .map(|s| expected_minutes(*s))
        .sum();

    Some((total - elapsed).max(after_current).max(1))
}

/// Whole seconds between two timestamps, `None` unless both are set.
pub fn duration(
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
) -> Option<i64> {
    match (started_at, completed_at) {
        (Some(start), Some(end)) => Some((end - start).num_seconds().max(0)),
        _ => None,
    }
}

/// When the video entered its current stage, as far as the row can tell.
pub fn stage_clock(video: &VideoRow) -> DateTime<Utc> {
    video.processing_started_at.unwrap_or(video.created_at)
}

/// True when a live, non-terminal video has outlived its stage timeout.
pub fn is_stuck(video: &VideoRow, now: DateTime<Utc>) -> bool {
    if video.is_deleted {
        return false;
    }
    let Some(status) = video.status() else {
        return false;
    };
    match stage_metadata(status).timeout_minutes {
        Some(minutes) if !is_terminal(status) => {
            now - stage_clock(video) > Duration::minutes(minutes)
        }
        _ => false,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Status query surface
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct StatusError {
    pub message: String,
    pub stage: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub video_id: Uuid,
    pub status: String,
    pub progress: u8,
    pub stage: StageMetadata,
    pub is_terminal: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub estimated_minutes_remaining: Option<i64>,
    pub error: Option<StatusError>,
    pub recovery_attempts: u32,
    pub next_steps: Vec<String>,
}

/// Builds the dashboard status payload. Always succeeds, whatever state the
/// status column or metadata bag is in.
pub fn status_report(video: &VideoRow, now: DateTime<Utc>) -> StatusReport {
    let status = video.status();
    let metadata = video.processing_metadata().unwrap_or_default();

    let (progress, stage, terminal, eta) = match status {
        Some(s) => (
            progress(s),
            stage_metadata(s),
            is_terminal(s),
            estimated_time_remaining(s, video.processing_started_at, now),
        ),
        None => (0, UNKNOWN_STAGE, false, None),
    };

    StatusReport {
        video_id: video.id,
        status: video.status.clone(),
        progress,
        stage,
        is_terminal: terminal,
        created_at: video.created_at,
        updated_at: video.updated_at,
        processing_started_at: video.processing_started_at,
        processing_completed_at: video.processing_completed_at,
        duration_seconds: duration(video.processing_started_at, video.processing_completed_at),
        estimated_minutes_remaining: eta,
        error: status_error(video, &metadata),
        recovery_attempts: metadata.recovery_attempts,
        next_steps: next_steps(status),
    }
}

fn status_error(video: &VideoRow, metadata: &ProcessingMetadata) -> Option<StatusError> {
    if let Some(last) = &metadata.last_error {
        return Some(StatusError {
            message: last.message.clone(),
            stage: Some(last.stage.clone()),
            timestamp: Some(last.timestamp),
            retry_count: metadata.retry_count,
        });
    }
    video.error_message.as_ref().map(|message| StatusError {
        message: message.clone(),
        stage: None,
        timestamp: None,
        retry_count: metadata.retry_count,
    })
}
