//! Fixtures and fakes shared by pipeline tests.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::models::video::{VideoRow, VideoStatus};
use crate::pipeline::events::{DispatchError, EventDispatcher, PipelineEvent};

pub fn video_fixture(status: VideoStatus) -> VideoRow {
    let now = Utc::now();
    VideoRow {
        id: Uuid::new_v4(),
        creator_id: Uuid::new_v4(),
        title: "Weekly livestream".to_string(),
        status: status.as_str().to_string(),
        transcript: None,
        transcript_segments: None,
        language: Some("en".to_string()),
        duration_seconds: Some(1800.0),
        file_size_bytes: Some(250 * 1024 * 1024),
        storage_path: None,
        error_message: None,
        metadata: json!({}),
        created_at: now,
        updated_at: now,
        processing_started_at: None,
        processing_completed_at: None,
        is_deleted: false,
    }
}

/// A video that entered processing a day before `now`, with a transcript and
/// an uploaded file.
pub fn stuck_video(status: VideoStatus, now: DateTime<Utc>) -> VideoRow {
    let mut video = video_fixture(status);
    video.created_at = now - Duration::days(1);
    video.updated_at = now - Duration::days(1);
    video.processing_started_at = Some(now - Duration::days(1));
    video.transcript = Some("welcome back to the channel today we are building a shed".to_string());
    video.storage_path = Some(format!("videos/{}/source.mp4", video.id));
    video
}

/// Dispatcher that records what would have been published.
#[derive(Default)]
pub struct RecordingDispatcher {
    events: Mutex<Vec<PipelineEvent>>,
    fail: bool,
}

impl RecordingDispatcher {
    pub fn failing() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventDispatcher for RecordingDispatcher {
    async fn publish(&self, event: &PipelineEvent) -> Result<String, DispatchError> {
        if self.fail {
            return Err(DispatchError::Rejected("queue offline".to_string()));
        }
        let mut events = self.events.lock().unwrap();
        events.push(event.clone());
        Ok(format!("{}-0", events.len()))
    }
}
