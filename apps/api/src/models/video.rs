use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;
use uuid::Uuid;

/// Pipeline status of a video. Ordered by stage; `Failed` is reachable from
/// any non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoStatus {
    Pending,
    Uploading,
    Transcribing,
    Processing,
    Embedding,
    Completed,
    Failed,
}

impl VideoStatus {
    pub const ALL: [VideoStatus; 7] = [
        VideoStatus::Pending,
        VideoStatus::Uploading,
        VideoStatus::Transcribing,
        VideoStatus::Processing,
        VideoStatus::Embedding,
        VideoStatus::Completed,
        VideoStatus::Failed,
    ];

    pub const NON_TERMINAL: [VideoStatus; 5] = [
        VideoStatus::Pending,
        VideoStatus::Uploading,
        VideoStatus::Transcribing,
        VideoStatus::Processing,
        VideoStatus::Embedding,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStatus::Pending => "pending",
            VideoStatus::Uploading => "uploading",
            VideoStatus::Transcribing => "transcribing",
            VideoStatus::Processing => "processing",
            VideoStatus::Embedding => "embedding",
            VideoStatus::Completed => "completed",
            VideoStatus::Failed => "failed",
        }
    }

    /// Parses a persisted status value. Unknown values yield `None` so callers
    /// can degrade instead of erroring.
    pub fn parse(raw: &str) -> Option<VideoStatus> {
        VideoStatus::ALL
            .into_iter()
            .find(|s| s.as_str() == raw)
    }
}

impl fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remediation chosen by the recovery sweep, persisted as `last_recovery_action`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryAction {
    RetryEmbeddings,
    FixStatus,
    MarkFailed,
    ManualRetry,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::RetryEmbeddings => "retry-embeddings",
            RecoveryAction::FixStatus => "fix-status",
            RecoveryAction::MarkFailed => "mark-failed",
            RecoveryAction::ManualRetry => "manual-retry",
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error recorded when a stage (or the recovery sweep) gives up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastError {
    pub stage: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Typed view of the `videos.metadata` JSONB column.
///
/// Keys this service doesn't know about are kept in `extra` and written back
/// untouched, so stage workers can stash their own bookkeeping there.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMetadata {
    #[serde(default)]
    pub recovery_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_recovery_attempt: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_recovery_action: Option<RecoveryAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    #[serde(default)]
    pub retry_count: u32,
    /// Seconds spent per stage, keyed by stage name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stage_durations: BTreeMap<String, f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProcessingMetadata {
    /// Validates the raw JSON column. `null` is treated as empty metadata.
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone())
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }
}

/// One timestamped span of transcript text as returned by the speech-to-text provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct VideoRow {
    pub id: Uuid,
    pub creator_id: Uuid,
    pub title: String,
    pub status: String,
    pub transcript: Option<String>,
    pub transcript_segments: Option<Value>,
    pub language: Option<String>,
    pub duration_seconds: Option<f64>,
    pub file_size_bytes: Option<i64>,
    pub storage_path: Option<String>,
    pub error_message: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
}

impl VideoRow {
    pub fn status(&self) -> Option<VideoStatus> {
        VideoStatus::parse(&self.status)
    }

    pub fn processing_metadata(&self) -> Result<ProcessingMetadata, serde_json::Error> {
        ProcessingMetadata::from_value(&self.metadata)
    }

    pub fn has_transcript(&self) -> bool {
        self.transcript
            .as_deref()
            .map(|t| !t.trim().is_empty())
            .unwrap_or(false)
    }

    /// Timestamped segments if the transcription stage stored any. Malformed
    /// segment data is ignored; the plain transcript is still usable.
    pub fn segments(&self) -> Vec<TranscriptSegment> {
        self.transcript_segments
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}
