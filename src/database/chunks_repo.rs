// Audio chunks repository for SalesControl
// Queued inserts from ingest, SKIP LOCKED claims and stuck-chunk recovery
// for the worker.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::models::{AudioChunk, ChunkStatus, NewChunk};
use super::Database;

const CHUNK_COLUMNS: &str = "chunk_id, device_id, point_id, register_id, start_ts, end_ts, \
     duration_sec, codec, sample_rate, channels, file_path, file_size, file_hash, \
     status, error_reason, created_at, processing_started_at";

impl Database {
    /// Find an existing row that makes this upload a recorder retry: same
    /// device, `start_ts` within one second, identical payload hash.
    pub async fn find_duplicate_chunk(
        &self,
        device_id: Uuid,
        start_ts: DateTime<Utc>,
        file_hash: &str,
    ) -> Result<Option<AudioChunk>> {
        let window = Duration::seconds(1);
        let chunk = sqlx::query_as::<_, AudioChunk>(&format!(
            r#"
            SELECT {CHUNK_COLUMNS}
            FROM audio_chunks
            WHERE device_id = $1
              AND start_ts BETWEEN $2 AND $3
              AND file_hash = $4
            LIMIT 1
            "#,
        ))
        .bind(device_id)
        .bind(start_ts - window)
        .bind(start_ts + window)
        .bind(file_hash)
        .fetch_optional(self.pool())
        .await
        .context("Failed to check for duplicate chunk")?;

        Ok(chunk)
    }

    /// Whether any chunk for this device overlaps `[start_ts, end_ts)`.
    pub async fn has_overlapping_chunk(
        &self,
        device_id: Uuid,
        start_ts: DateTime<Utc>,
        end_ts: DateTime<Utc>,
    ) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM audio_chunks
                WHERE device_id = $1 AND start_ts < $3 AND end_ts > $2
            )
            "#,
        )
        .bind(device_id)
        .bind(start_ts)
        .bind(end_ts)
        .fetch_one(self.pool())
        .await
        .context("Failed to check for overlapping chunk")?;

        Ok(exists)
    }

    /// Insert a chunk row in QUEUED state.
    pub async fn insert_queued_chunk(&self, chunk: &NewChunk) -> Result<AudioChunk> {
        let inserted = sqlx::query_as::<_, AudioChunk>(&format!(
            r#"
            INSERT INTO audio_chunks (
                chunk_id, device_id, point_id, register_id, start_ts, end_ts,
                duration_sec, codec, sample_rate, channels, file_path, file_size,
                file_hash, status
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, 'QUEUED')
            RETURNING {CHUNK_COLUMNS}
            "#,
        ))
        .bind(chunk.chunk_id)
        .bind(chunk.device_id)
        .bind(&chunk.point_id)
        .bind(&chunk.register_id)
        .bind(chunk.start_ts)
        .bind(chunk.end_ts)
        .bind(chunk.duration_sec)
        .bind(&chunk.codec)
        .bind(chunk.sample_rate)
        .bind(chunk.channels)
        .bind(&chunk.file_path)
        .bind(chunk.file_size)
        .bind(&chunk.file_hash)
        .fetch_one(self.pool())
        .await
        .context("Failed to insert chunk")?;

        Ok(inserted)
    }

    /// Claim up to `batch_size` QUEUED chunks for processing.
    ///
    /// Single statement: SKIP LOCKED keeps concurrent workers from claiming
    /// the same row, and the UPDATE flips status and stamps
    /// `processing_started_at` in the same transaction as the select.
    pub async fn claim_chunks(&self, batch_size: u32) -> Result<Vec<AudioChunk>> {
        let claimed = sqlx::query_as::<_, AudioChunk>(
            r#"
            WITH claimed AS (
                SELECT chunk_id
                FROM audio_chunks
                WHERE status = 'QUEUED'
                ORDER BY created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE audio_chunks
            SET status = 'PROCESSING',
                processing_started_at = NOW()
            FROM claimed
            WHERE audio_chunks.chunk_id = claimed.chunk_id
            RETURNING audio_chunks.chunk_id, audio_chunks.device_id,
                      audio_chunks.point_id, audio_chunks.register_id,
                      audio_chunks.start_ts, audio_chunks.end_ts,
                      audio_chunks.duration_sec, audio_chunks.codec,
                      audio_chunks.sample_rate, audio_chunks.channels,
                      audio_chunks.file_path, audio_chunks.file_size,
                      audio_chunks.file_hash, audio_chunks.status,
                      audio_chunks.error_reason, audio_chunks.created_at,
                      audio_chunks.processing_started_at
            "#,
        )
        .bind(batch_size as i64)
        .fetch_all(self.pool())
        .await
        .context("Failed to claim chunks")?;

        Ok(claimed)
    }

    /// Requeue chunks stuck in PROCESSING longer than `stuck_timeout_sec`.
    ///
    /// Safe to replay: the per-chunk commit is atomic, so a requeued chunk
    /// has written nothing yet.
    pub async fn requeue_stuck_chunks(&self, stuck_timeout_sec: u64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::seconds(stuck_timeout_sec as i64);

        let result = sqlx::query(
            r#"
            UPDATE audio_chunks
            SET status = 'QUEUED',
                processing_started_at = NULL
            WHERE status = 'PROCESSING'
              AND processing_started_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(self.pool())
        .await
        .context("Failed to requeue stuck chunks")?;

        Ok(result.rows_affected())
    }

    /// Mark a chunk as failed with a short reason. ERROR is terminal; the
    /// recovery loop ignores it.
    pub async fn mark_chunk_error(&self, chunk_id: Uuid, reason: &str) -> Result<()> {
        sqlx::query(
            "UPDATE audio_chunks SET status = 'ERROR', error_reason = $2 WHERE chunk_id = $1",
        )
        .bind(chunk_id)
        .bind(reason)
        .execute(self.pool())
        .await
        .context("Failed to mark chunk as errored")?;

        Ok(())
    }

    /// Fetch one chunk by id.
    pub async fn get_chunk(&self, chunk_id: Uuid) -> Result<Option<AudioChunk>> {
        let chunk = sqlx::query_as::<_, AudioChunk>(&format!(
            "SELECT {CHUNK_COLUMNS} FROM audio_chunks WHERE chunk_id = $1",
        ))
        .bind(chunk_id)
        .fetch_optional(self.pool())
        .await
        .context("Failed to fetch chunk")?;

        Ok(chunk)
    }

    /// Whether a chunk row exists. Used by the orphan-file sweep.
    pub async fn chunk_exists(&self, chunk_id: Uuid) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM audio_chunks WHERE chunk_id = $1)")
                .bind(chunk_id)
                .fetch_one(self.pool())
                .await
                .context("Failed to check chunk existence")?;

        Ok(exists)
    }

    /// Recent chunks for the admin status listing, optionally filtered.
    pub async fn list_chunks(
        &self,
        status: Option<ChunkStatus>,
        limit: i64,
    ) -> Result<Vec<AudioChunk>> {
        let chunks = match status {
            Some(status) => {
                sqlx::query_as::<_, AudioChunk>(&format!(
                    r#"
                    SELECT {CHUNK_COLUMNS} FROM audio_chunks
                    WHERE status = $1
                    ORDER BY created_at DESC
                    LIMIT $2
                    "#,
                ))
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(self.pool())
                .await
            }
            None => {
                sqlx::query_as::<_, AudioChunk>(&format!(
                    "SELECT {CHUNK_COLUMNS} FROM audio_chunks ORDER BY created_at DESC LIMIT $1",
                ))
                .bind(limit)
                .fetch_all(self.pool())
                .await
            }
        }
        .context("Failed to list chunks")?;

        Ok(chunks)
    }
}
