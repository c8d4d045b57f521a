//! Recovery engine: periodic sweep that re-drives stuck videos.
//!
//! Flow per candidate: budget gate → cooldown gate → artifact inspection →
//! decision matrix → one conditioned store write → optional event publish.
//!
//! Decisions (`classify_candidate`, `decide_remediation`) are pure; effects
//! live in `execute` so the matrix can be tested without a store or queue.
//! The matrix reads persisted artifacts rather than the status column, since
//! a worker can finish embedding and crash before writing its final status.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::RecoveryConfig;
use crate::errors::AppError;
use crate::models::video::{LastError, ProcessingMetadata, RecoveryAction, VideoRow, VideoStatus};
use crate::pipeline::contract::ArtifactSummary;
use crate::pipeline::events::{EventDispatcher, PipelineEvent};
use crate::pipeline::store::{RecoveryWrite, VideoStore};

/// Automatic attempts per video before it is marked permanently failed.
pub const MAX_RECOVERY_ATTEMPTS: u32 = 3;
/// Minimum spacing between two automatic attempts on the same video.
pub const MIN_RETRY_INTERVAL_SECS: i64 = 60 * 60;

// ────────────────────────────────────────────────────────────────────────────
// Result surface
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Recovered,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateReport {
    pub video_id: Uuid,
    pub status: String,
    pub outcome: RecoveryOutcome,
    pub reason: String,
    pub action: Option<RecoveryAction>,
    pub event_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepSummary {
    pub started_at: DateTime<Utc>,
    pub execution_ms: u128,
    pub total_candidates: usize,
    pub recovered: usize,
    pub failed: usize,
    pub skipped: usize,
    pub results: Vec<CandidateReport>,
}

// ────────────────────────────────────────────────────────────────────────────
// Pure decisions
// ────────────────────────────────────────────────────────────────────────────

/// Outcome of the budget and cooldown gates, evaluated before any artifact read.
#[derive(Debug, Clone, PartialEq)]
pub enum Gate {
    BudgetExhausted { attempts: u32 },
    CoolingDown { elapsed: Duration, remaining: Duration },
    Proceed { attempts: u32 },
}

pub fn classify_candidate(
    metadata: &ProcessingMetadata,
    now: DateTime<Utc>,
    config: &RecoveryConfig,
) -> Gate {
    let attempts = metadata.recovery_attempts;
    if attempts >= config.max_attempts {
        return Gate::BudgetExhausted { attempts };
    }
    if let Some(last) = metadata.last_recovery_attempt {
        let elapsed = now - last;
        let interval = Duration::seconds(config.min_retry_interval_secs);
        if elapsed < interval {
            return Gate::CoolingDown {
                elapsed,
                remaining: interval - elapsed,
            };
        }
    }
    Gate::Proceed { attempts }
}

/// The decision matrix. `None` means there is nothing safe to do automatically.
pub fn decide_remediation(summary: &ArtifactSummary) -> Option<RecoveryAction> {
    match (
        summary.has_transcript,
        summary.is_chunked(),
        summary.is_embedded(),
    ) {
        (false, _, _) => None,
        (true, false, _) => Some(RecoveryAction::RetryEmbeddings),
        (true, true, false) => Some(RecoveryAction::RetryEmbeddings),
        (true, true, true) => Some(RecoveryAction::FixStatus),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Sweep
// ────────────────────────────────────────────────────────────────────────────

/// Runs one sweep. Only a failure of the selection query fails the sweep;
/// per-candidate errors are reported as `failed` outcomes.
pub async fn run_sweep(
    store: &dyn VideoStore,
    dispatcher: &dyn EventDispatcher,
    config: &RecoveryConfig,
    now: DateTime<Utc>,
) -> Result<SweepSummary> {
    let started = Instant::now();
    let candidates = store.find_stuck_videos(now, config.batch_limit).await?;
    info!("Recovery sweep found {} stuck videos", candidates.len());

    let results: Vec<CandidateReport> = stream::iter(0..candidates.len())
        .map(|i| recover_candidate(store, dispatcher, config, &candidates[i], now))
        .buffered(config.concurrency.max(1))
        .collect()
        .await;

    let count = |o: RecoveryOutcome| results.iter().filter(|r| r.outcome == o).count();
    let summary = SweepSummary {
        started_at: now,
        execution_ms: started.elapsed().as_millis(),
        total_candidates: candidates.len(),
        recovered: count(RecoveryOutcome::Recovered),
        failed: count(RecoveryOutcome::Failed),
        skipped: count(RecoveryOutcome::Skipped),
        results,
    };

    info!(
        "Recovery sweep done in {}ms: {} recovered, {} failed, {} skipped of {}",
        summary.execution_ms,
        summary.recovered,
        summary.failed,
        summary.skipped,
        summary.total_candidates
    );
    Ok(summary)
}

async fn recover_candidate(
    store: &dyn VideoStore,
    dispatcher: &dyn EventDispatcher,
    config: &RecoveryConfig,
    video: &VideoRow,
    now: DateTime<Utc>,
) -> CandidateReport {
    let report = match execute(store, dispatcher, config, video, now).await {
        Ok(report) => report,
        Err(e) => CandidateReport {
            video_id: video.id,
            status: video.status.clone(),
            outcome: RecoveryOutcome::Failed,
            reason: format!("Recovery error: {e:#}"),
            action: None,
            event_id: None,
        },
    };

    match report.outcome {
        RecoveryOutcome::Recovered => info!(
            "Recovered video {} ({}): {}",
            report.video_id, report.status, report.reason
        ),
        RecoveryOutcome::Failed | RecoveryOutcome::Skipped => warn!(
            "Recovery {:?} for video {} ({}): {}",
            report.outcome, report.video_id, report.status, report.reason
        ),
    }
    report
}

async fn execute(
    store: &dyn VideoStore,
    dispatcher: &dyn EventDispatcher,
    config: &RecoveryConfig,
    video: &VideoRow,
    now: DateTime<Utc>,
) -> Result<CandidateReport> {
    let status = video
        .status()
        .ok_or_else(|| anyhow!("Unrecognised status '{}'", video.status))?;
    let metadata = video
        .processing_metadata()
        .map_err(|e| anyhow!("Malformed processing metadata: {e}"))?;

    let report = |outcome: RecoveryOutcome,
                  reason: String,
                  action: Option<RecoveryAction>,
                  event_id: Option<String>| CandidateReport {
        video_id: video.id,
        status: video.status.clone(),
        outcome,
        reason,
        action,
        event_id,
    };
    let lost_race = || {
        report(
            RecoveryOutcome::Skipped,
            "Video changed while the sweep was running".to_string(),
            None,
            None,
        )
    };

    let attempts = match classify_candidate(&metadata, now, config) {
        Gate::BudgetExhausted { attempts } => {
            let error = LastError {
                stage: status.as_str().to_string(),
                message: format!(
                    "Processing stalled in '{status}' and {attempts} automatic recovery attempts did not help"
                ),
                timestamp: now,
            };
            if !store
                .mark_failed(video.id, status, &error, RecoveryAction::MarkFailed)
                .await?
            {
                return Ok(lost_race());
            }
            return Ok(report(
                RecoveryOutcome::Failed,
                error.message,
                Some(RecoveryAction::MarkFailed),
                None,
            ));
        }
        Gate::CoolingDown { elapsed, remaining } => {
            return Ok(report(
                RecoveryOutcome::Skipped,
                format!(
                    "Last recovery attempt was {} minutes ago; next attempt allowed in {} minutes",
                    elapsed.num_minutes(),
                    remaining.num_minutes()
                ),
                None,
                None,
            ));
        }
        Gate::Proceed { attempts } => attempts,
    };

    let summary = store
        .artifact_summary(video.id)
        .await?
        .ok_or_else(|| anyhow!("Video {} disappeared during recovery", video.id))?;

    let Some(action) = decide_remediation(&summary) else {
        // stamp it so the cooldown applies and it sorts behind fresh candidates
        if !store.record_inspection(video.id, status, now).await? {
            return Ok(lost_race());
        }
        return Ok(report(
            RecoveryOutcome::Failed,
            "No viable recovery action: video has no transcript".to_string(),
            None,
            None,
        ));
    };

    let write = RecoveryWrite {
        attempts: attempts + 1,
        at: now,
        action,
        complete: action == RecoveryAction::FixStatus,
    };
    if !store.record_recovery(video.id, status, attempts, &write).await? {
        return Ok(lost_race());
    }

    match action {
        RecoveryAction::FixStatus => Ok(report(
            RecoveryOutcome::Recovered,
            format!(
                "{} of {} chunks already embedded; status corrected to completed",
                summary.embedded_chunk_count, summary.chunk_count
            ),
            Some(action),
            None,
        )),
        _ => {
            let event = PipelineEvent::EmbeddingsRequested {
                video_id: video.id,
                creator_id: video.creator_id,
                transcript: video.transcript.clone().unwrap_or_default(),
                skip_if_exists: true,
            };
            let event_id = dispatcher.publish(&event).await?;
            Ok(report(
                RecoveryOutcome::Recovered,
                format!(
                    "Re-requested chunking and embeddings (attempt {} of {})",
                    write.attempts, config.max_attempts
                ),
                Some(action),
                Some(event_id),
            ))
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Scheduling and operator actions
// ────────────────────────────────────────────────────────────────────────────

/// Runs a sweep every `interval_secs` until the process exits. A failed sweep
/// is logged and the next tick tries again.
pub fn spawn_scheduler(
    store: Arc<dyn VideoStore>,
    dispatcher: Arc<dyn EventDispatcher>,
    config: RecoveryConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!("Recovery scheduler running every {}s", config.interval_secs);

        loop {
            ticker.tick().await;
            if let Err(e) = run_sweep(store.as_ref(), dispatcher.as_ref(), &config, Utc::now()).await
            {
                error!("Recovery sweep aborted: {e:#}");
            }
        }
    })
}

#[derive(Debug, Serialize)]
pub struct ManualRetryResponse {
    pub video_id: Uuid,
    pub status: VideoStatus,
    pub event_id: String,
}

/// Operator-initiated full retry: resets the attempt budget and re-requests
/// transcription from the stored upload.
pub async fn manual_retry(
    store: &dyn VideoStore,
    dispatcher: &dyn EventDispatcher,
    video_id: Uuid,
    now: DateTime<Utc>,
) -> Result<ManualRetryResponse, AppError> {
    let video = store
        .get_video(video_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Video {video_id} not found")))?;

    if video.status() == Some(VideoStatus::Completed) {
        return Err(AppError::Conflict(format!(
            "Video {video_id} is already completed"
        )));
    }
    let storage_path = video.storage_path.clone().ok_or_else(|| {
        AppError::Validation(format!("Video {video_id} has no uploaded file to retry"))
    })?;

    if !store.reset_for_retry(video_id, now).await? {
        return Err(AppError::Conflict(format!(
            "Video {video_id} changed before it could be retried"
        )));
    }

    let event_id = dispatcher
        .publish(&PipelineEvent::TranscribeRequested {
            video_id,
            creator_id: video.creator_id,
            storage_path,
        })
        .await?;

    info!("Manual retry requested for video {video_id}");
    Ok(ManualRetryResponse {
        video_id,
        status: VideoStatus::Transcribing,
        event_id,
    })
}
