use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::models::chat::ChatSessionRow;
use crate::models::chunk::{ChunkRow, NewChunk};
use crate::models::video::{LastError, RecoveryAction, VideoRow, VideoStatus};
use crate::pipeline::contract::ArtifactSummary;
use crate::pipeline::state_machine::{is_terminal, stage_metadata};

use super::{
    failure_patch, inspection_patch, manual_retry_patch, sweep_order, RecoveryWrite, VideoStore,
};

/// Postgres-backed store. Cloning is cheap; the pool is reference counted.
#[derive(Clone)]
pub struct PgVideoStore {
    pool: PgPool,
}

impl PgVideoStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn status_strings(statuses: &[VideoStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

#[async_trait]
impl VideoStore for PgVideoStore {
    async fn get_video(&self, video_id: Uuid) -> Result<Option<VideoRow>> {
        Ok(
            sqlx::query_as::<_, VideoRow>("SELECT * FROM videos WHERE id = $1 AND is_deleted = false")
                .bind(video_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn find_stuck_videos(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<VideoRow>> {
        let mut stuck = Vec::new();

        // One query per stage: each stage has its own timeout.
        for status in VideoStatus::NON_TERMINAL {
            let Some(minutes) = stage_metadata(status).timeout_minutes else {
                continue;
            };
            let cutoff = now - Duration::minutes(minutes);
            let rows = sqlx::query_as::<_, VideoRow>(
                r#"
                SELECT * FROM videos
                WHERE is_deleted = false
                  AND status = $1
                  AND COALESCE(processing_started_at, created_at) < $2
                ORDER BY (metadata->>'last_recovery_attempt')::timestamptz ASC NULLS FIRST,
                         COALESCE(processing_started_at, created_at) ASC
                LIMIT $3
                "#,
            )
            .bind(status.as_str())
            .bind(cutoff)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Failed to select stuck videos in '{status}'"))?;
            debug!("{} stuck candidates in {}", rows.len(), status);
            stuck.extend(rows);
        }

        stuck.sort_by_key(sweep_order);
        stuck.truncate(limit.max(0) as usize);
        Ok(stuck)
    }

    async fn artifact_summary(&self, video_id: Uuid) -> Result<Option<ArtifactSummary>> {
        let row: Option<(bool, i64, i64)> = sqlx::query_as(
            r#"
            SELECT
                COALESCE(length(trim(v.transcript)) > 0, false),
                (SELECT COUNT(*) FROM chunks c WHERE c.video_id = v.id),
                (SELECT COUNT(*) FROM chunks c WHERE c.video_id = v.id AND c.embedding IS NOT NULL)
            FROM videos v
            WHERE v.id = $1
            "#,
        )
        .bind(video_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(has_transcript, chunk_count, embedded_chunk_count)| ArtifactSummary {
                has_transcript,
                chunk_count,
                embedded_chunk_count,
            },
        ))
    }

    async fn record_recovery(
        &self,
        video_id: Uuid,
        expected_status: VideoStatus,
        expected_attempts: u32,
        write: &RecoveryWrite,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE videos SET
                metadata = COALESCE(metadata, '{}'::jsonb) || $4,
                status = CASE WHEN $5 THEN 'completed' ELSE status END,
                processing_completed_at = CASE WHEN $5 THEN $6 ELSE processing_completed_at END,
                updated_at = $6
            WHERE id = $1
              AND is_deleted = false
              AND status = $2
              AND COALESCE((metadata->>'recovery_attempts')::int, 0) = $3
            "#,
        )
        .bind(video_id)
        .bind(expected_status.as_str())
        .bind(expected_attempts as i32)
        .bind(write.metadata_patch())
        .bind(write.complete)
        .bind(write.at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_inspection(
        &self,
        video_id: Uuid,
        expected_status: VideoStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE videos SET
                metadata = COALESCE(metadata, '{}'::jsonb) || $3
            WHERE id = $1 AND is_deleted = false AND status = $2
            "#,
        )
        .bind(video_id)
        .bind(expected_status.as_str())
        .bind(inspection_patch(at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(
        &self,
        video_id: Uuid,
        expected_status: VideoStatus,
        error: &LastError,
        action: RecoveryAction,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE videos SET
                status = 'failed',
                error_message = $3,
                metadata = COALESCE(metadata, '{}'::jsonb) || $4,
                processing_completed_at = $5,
                updated_at = $5
            WHERE id = $1 AND is_deleted = false AND status = $2
            "#,
        )
        .bind(video_id)
        .bind(expected_status.as_str())
        .bind(&error.message)
        .bind(failure_patch(error, action))
        .bind(error.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn transition_status(
        &self,
        video_id: Uuid,
        from: &[VideoStatus],
        to: VideoStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let completed_at = is_terminal(to).then_some(now);
        let result = sqlx::query(
            r#"
            UPDATE videos SET
                status = $3,
                processing_completed_at = $4,
                updated_at = $5
            WHERE id = $1 AND is_deleted = false AND status = ANY($2)
            "#,
        )
        .bind(video_id)
        .bind(status_strings(from))
        .bind(to.as_str())
        .bind(completed_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn begin_processing(
        &self,
        video_id: Uuid,
        storage_path: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE videos SET
                status = 'transcribing',
                storage_path = $2,
                processing_started_at = $3,
                processing_completed_at = NULL,
                updated_at = $3
            WHERE id = $1 AND is_deleted = false AND status IN ('pending', 'uploading')
            "#,
        )
        .bind(video_id)
        .bind(storage_path)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn reset_for_retry(&self, video_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE videos SET
                status = 'transcribing',
                error_message = NULL,
                metadata = (COALESCE(metadata, '{}'::jsonb) - 'last_error') || $2,
                processing_started_at = $3,
                processing_completed_at = NULL,
                updated_at = $3
            WHERE id = $1 AND is_deleted = false AND status <> 'completed'
            "#,
        )
        .bind(video_id)
        .bind(manual_retry_patch(now))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn store_transcript(
        &self,
        video_id: Uuid,
        transcript: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE videos SET transcript = $2, updated_at = $3
            WHERE id = $1
              AND is_deleted = false
              AND (transcript IS NULL OR length(trim(transcript)) = 0)
            "#,
        )
        .bind(video_id)
        .bind(transcript)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_chunks(&self, video_id: Uuid) -> Result<Vec<ChunkRow>> {
        Ok(sqlx::query_as::<_, ChunkRow>(
            "SELECT * FROM chunks WHERE video_id = $1 ORDER BY chunk_index ASC",
        )
        .bind(video_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn insert_chunks(&self, video_id: Uuid, chunks: &[NewChunk]) -> Result<Vec<ChunkRow>> {
        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, video_id, chunk_index, text, start_time, end_time)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (video_id, chunk_index) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(video_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(chunk.start_time)
            .bind(chunk.end_time)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.list_chunks(video_id).await
    }

    async fn set_chunk_embedding(&self, chunk_id: Uuid, embedding: &[f32]) -> Result<bool> {
        let result =
            sqlx::query("UPDATE chunks SET embedding = $2 WHERE id = $1 AND embedding IS NULL")
                .bind(chunk_id)
                .bind(embedding)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn chunks_for_scope(
        &self,
        creator_id: Uuid,
        video_ids: &[Uuid],
    ) -> Result<Vec<ChunkRow>> {
        Ok(sqlx::query_as::<_, ChunkRow>(
            r#"
            SELECT c.* FROM chunks c
            JOIN videos v ON v.id = c.video_id
            WHERE v.creator_id = $1
              AND v.is_deleted = false
              AND v.status = 'completed'
              AND c.embedding IS NOT NULL
              AND (cardinality($2::uuid[]) = 0 OR v.id = ANY($2))
            ORDER BY v.created_at ASC, c.chunk_index ASC
            "#,
        )
        .bind(creator_id)
        .bind(video_ids)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn get_chat_session(&self, session_id: Uuid) -> Result<Option<ChatSessionRow>> {
        Ok(
            sqlx::query_as::<_, ChatSessionRow>("SELECT * FROM chat_sessions WHERE id = $1")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }
}
