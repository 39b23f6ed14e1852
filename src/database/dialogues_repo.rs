// Dialogues repository for SalesControl
// The per-chunk commit transaction: segments, dialogue mutations, state row
// and the DONE flip all land atomically under the device advisory lock.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use super::models::{AudioChunk, DeviceDialogueState, SpeechSegment};
use super::{device_lock_key, Database};
use crate::stitcher::{stitch_chunk, AbsoluteSegment, DialogueOp, OpenDialogue, StitchConfig};

/// What a chunk commit changed, for metrics and logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommitOutcome {
    pub segments_written: usize,
    pub dialogues_opened: usize,
    pub dialogues_extended: usize,
    pub dialogues_closed: usize,
}

impl Database {
    /// Commit one processed chunk: insert its speech segments, apply the
    /// stitching plan, replace the device's dialogue state and flip the chunk
    /// to DONE, all in one transaction.
    ///
    /// The advisory lock serializes commits per device across worker
    /// processes; the dialogue state is read only after the lock is held, so
    /// the stitching plan always sees the latest committed cursor. If this
    /// transaction fails, the chunk stays PROCESSING and the recovery loop
    /// requeues it later with nothing persisted.
    pub async fn commit_chunk_results(
        &self,
        chunk: &AudioChunk,
        segments_ms: &[(i32, i32)],
        config: StitchConfig,
    ) -> Result<CommitOutcome> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .context("Failed to begin chunk commit transaction")?;

        lock_device(&mut tx, chunk.device_id).await?;

        let prior = fetch_dialogue_state(&mut tx, chunk.device_id).await?;

        // Mint segment ids and translate to absolute time for stitching.
        let segment_rows: Vec<SpeechSegment> = segments_ms
            .iter()
            .map(|&(start_ms, end_ms)| SpeechSegment {
                segment_id: Uuid::new_v4(),
                chunk_id: chunk.chunk_id,
                start_ms,
                end_ms,
            })
            .collect();
        let absolute: Vec<AbsoluteSegment> = segment_rows
            .iter()
            .map(|segment| AbsoluteSegment {
                segment_id: segment.segment_id,
                start: chunk.start_ts + Duration::milliseconds(segment.start_ms as i64),
                end: chunk.start_ts + Duration::milliseconds(segment.end_ms as i64),
            })
            .collect();

        let plan = stitch_chunk(config, prior, chunk.start_ts, &absolute);

        for segment in &segment_rows {
            sqlx::query(
                "INSERT INTO speech_segments (segment_id, chunk_id, start_ms, end_ms)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(segment.segment_id)
            .bind(segment.chunk_id)
            .bind(segment.start_ms)
            .bind(segment.end_ms)
            .execute(&mut *tx)
            .await
            .context("Failed to insert speech segment")?;
        }

        // Splits close one dialogue and open the next within a single
        // commit, so closures come from the plan, not from whether the
        // state row ends up deleted.
        let mut outcome = CommitOutcome {
            segments_written: segment_rows.len(),
            dialogues_closed: plan.closed,
            ..Default::default()
        };

        for op in &plan.ops {
            match op {
                DialogueOp::Open {
                    dialogue_id,
                    start_ts,
                    end_ts,
                } => {
                    sqlx::query(
                        "INSERT INTO dialogues
                             (dialogue_id, device_id, point_id, register_id, start_ts, end_ts)
                         VALUES ($1, $2, $3, $4, $5, $6)",
                    )
                    .bind(dialogue_id)
                    .bind(chunk.device_id)
                    .bind(&chunk.point_id)
                    .bind(&chunk.register_id)
                    .bind(start_ts)
                    .bind(end_ts)
                    .execute(&mut *tx)
                    .await
                    .context("Failed to insert dialogue")?;
                    outcome.dialogues_opened += 1;
                }
                DialogueOp::Extend {
                    dialogue_id,
                    end_ts,
                } => {
                    sqlx::query("UPDATE dialogues SET end_ts = $2 WHERE dialogue_id = $1")
                        .bind(dialogue_id)
                        .bind(end_ts)
                        .execute(&mut *tx)
                        .await
                        .context("Failed to extend dialogue")?;
                    outcome.dialogues_extended += 1;
                }
            }
        }

        for (segment_id, dialogue_id) in &plan.links {
            sqlx::query(
                "INSERT INTO dialogue_segments (dialogue_id, chunk_id, segment_id)
                 VALUES ($1, $2, $3)",
            )
            .bind(dialogue_id)
            .bind(chunk.chunk_id)
            .bind(segment_id)
            .execute(&mut *tx)
            .await
            .context("Failed to link segment to dialogue")?;
        }

        match plan.final_state {
            Some(state) => {
                sqlx::query(
                    r#"
                    INSERT INTO device_dialogue_state
                        (device_id, open_dialogue_id, dialogue_started_at, last_speech_end_ts)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (device_id) DO UPDATE
                    SET open_dialogue_id = EXCLUDED.open_dialogue_id,
                        dialogue_started_at = EXCLUDED.dialogue_started_at,
                        last_speech_end_ts = EXCLUDED.last_speech_end_ts
                    "#,
                )
                .bind(chunk.device_id)
                .bind(state.dialogue_id)
                .bind(state.started_at)
                .bind(state.last_speech_end)
                .execute(&mut *tx)
                .await
                .context("Failed to upsert device dialogue state")?;
            }
            None => {
                sqlx::query("DELETE FROM device_dialogue_state WHERE device_id = $1")
                    .bind(chunk.device_id)
                    .execute(&mut *tx)
                    .await
                    .context("Failed to delete device dialogue state")?;
            }
        }

        sqlx::query("UPDATE audio_chunks SET status = 'DONE' WHERE chunk_id = $1")
            .bind(chunk.chunk_id)
            .execute(&mut *tx)
            .await
            .context("Failed to mark chunk DONE")?;

        tx.commit()
            .await
            .context("Failed to commit chunk results")?;

        Ok(outcome)
    }

    /// Close dialogue-state rows for devices that have gone quiet.
    ///
    /// A row qualifies when its last speech ended more than `idle_threshold`
    /// ago and the device has no chunks still waiting to be processed (a
    /// backlogged chunk could legitimately extend the dialogue). Each close
    /// re-checks under the device's advisory lock.
    pub async fn close_idle_dialogue_states(&self, idle_threshold: Duration) -> Result<u64> {
        let cutoff = Utc::now() - idle_threshold;

        let idle_devices: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT s.device_id
            FROM device_dialogue_state s
            WHERE s.last_speech_end_ts < $1
              AND NOT EXISTS (
                  SELECT 1 FROM audio_chunks c
                  WHERE c.device_id = s.device_id
                    AND c.status IN ('QUEUED', 'PROCESSING')
              )
            "#,
        )
        .bind(cutoff)
        .fetch_all(self.pool())
        .await
        .context("Failed to find idle dialogue states")?;

        let mut closed = 0u64;
        for device_id in idle_devices {
            let mut tx = self
                .pool()
                .begin()
                .await
                .context("Failed to begin idle-close transaction")?;

            lock_device(&mut tx, device_id).await?;

            let result = sqlx::query(
                r#"
                DELETE FROM device_dialogue_state s
                WHERE s.device_id = $1
                  AND s.last_speech_end_ts < $2
                  AND NOT EXISTS (
                      SELECT 1 FROM audio_chunks c
                      WHERE c.device_id = s.device_id
                        AND c.status IN ('QUEUED', 'PROCESSING')
                  )
                "#,
            )
            .bind(device_id)
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .context("Failed to close idle dialogue state")?;

            tx.commit()
                .await
                .context("Failed to commit idle-close transaction")?;

            closed += result.rows_affected();
        }

        Ok(closed)
    }

}

/// Take the per-device advisory lock for the current transaction. Released
/// automatically at commit or rollback.
async fn lock_device(tx: &mut Transaction<'_, Postgres>, device_id: Uuid) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(device_lock_key(device_id))
        .execute(&mut **tx)
        .await
        .context("Failed to take device advisory lock")?;
    Ok(())
}

async fn fetch_dialogue_state(
    tx: &mut Transaction<'_, Postgres>,
    device_id: Uuid,
) -> Result<Option<OpenDialogue>> {
    let row = sqlx::query_as::<_, DeviceDialogueState>(
        r#"
        SELECT device_id, open_dialogue_id, dialogue_started_at, last_speech_end_ts
        FROM device_dialogue_state
        WHERE device_id = $1
        "#,
    )
    .bind(device_id)
    .fetch_optional(&mut **tx)
    .await
    .context("Failed to read device dialogue state")?;

    Ok(row.map(|state| OpenDialogue {
        dialogue_id: state.open_dialogue_id,
        started_at: state.dialogue_started_at,
        last_speech_end: state.last_speech_end_ts,
    }))
}
