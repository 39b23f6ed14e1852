// Per-chunk processing pipeline
// Read with retry, decode + VAD on the blocking pool, then the atomic commit.
// Chunks of one device run in start_ts order; devices run in parallel.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::audio::{decode_ogg_opus, detect_speech_spans, SpeechSpan};
use crate::config::WorkerConfig;
use crate::database::{AudioChunk, Database};
use crate::stitcher::StitchConfig;

use super::metrics::WorkerMetrics;

/// Error reasons are persisted; keep them short.
const MAX_ERROR_REASON_LEN: usize = 200;

/// Process one claimed batch.
///
/// The batch is sorted by (device_id, start_ts) and split per device: a
/// device's chunks must commit in start order for stitching, while distinct
/// devices are independent and fan out concurrently.
pub async fn process_batch(
    db: &Database,
    config: &Arc<WorkerConfig>,
    metrics: &Arc<WorkerMetrics>,
    mut chunks: Vec<AudioChunk>,
) {
    chunks.sort_by(|a, b| {
        a.device_id
            .cmp(&b.device_id)
            .then_with(|| a.start_ts.cmp(&b.start_ts))
    });

    let mut by_device: Vec<(Uuid, Vec<AudioChunk>)> = Vec::new();
    for chunk in chunks {
        if let Some((device_id, group)) = by_device.last_mut() {
            if *device_id == chunk.device_id {
                group.push(chunk);
                continue;
            }
        }
        by_device.push((chunk.device_id, vec![chunk]));
    }

    let mut tasks = JoinSet::new();
    for (device_id, group) in by_device {
        let db = db.clone();
        let config = config.clone();
        let metrics = metrics.clone();
        tasks.spawn(async move {
            for chunk in group {
                if !process_chunk(&db, &config, &metrics, chunk).await {
                    // A failed commit leaves that chunk PROCESSING; committing
                    // its successors now would stitch out of start_ts order.
                    // Leave the rest of this device's batch to the recovery
                    // path as well.
                    break;
                }
            }
            device_id
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            log::error!("Device processing task panicked: {}", e);
        }
    }
}

/// Run the full pipeline for one chunk. Failures never propagate past the
/// chunk: terminal ones land in ERROR, commit failures leave the chunk in
/// PROCESSING for the recovery loop.
///
/// Returns false when the device's remaining chunks in this batch must not
/// proceed (the chunk neither committed nor reached a terminal state).
async fn process_chunk(
    db: &Database,
    config: &Arc<WorkerConfig>,
    metrics: &Arc<WorkerMetrics>,
    chunk: AudioChunk,
) -> bool {
    let path = config.audio_storage_dir.join(&chunk.file_path);

    let bytes = match read_with_retry(&path, config).await {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!(
                "Chunk {} audio unreadable after {} retries: {:#}",
                chunk.chunk_id,
                config.max_retries,
                e
            );
            return fail_chunk(db, metrics, chunk.chunk_id, &format!("audio unreadable: {:#}", e))
                .await;
        }
    };

    // Decode and VAD are CPU-bound; keep them off the async runtime.
    let aggressiveness = config.vad_aggressiveness;
    let frame_ms = config.vad_frame_ms;
    let decoded = tokio::task::spawn_blocking(move || -> Result<Vec<SpeechSpan>> {
        let samples = decode_ogg_opus(&bytes).context("decode failed")?;
        detect_speech_spans(&samples, aggressiveness, frame_ms)
    })
    .await;

    let spans = match decoded {
        Ok(Ok(spans)) => spans,
        Ok(Err(e)) => {
            log::warn!("Chunk {} decode/VAD failed: {:#}", chunk.chunk_id, e);
            return fail_chunk(db, metrics, chunk.chunk_id, &format!("decode/vad: {:#}", e)).await;
        }
        Err(e) => {
            log::error!("Chunk {} processing task panicked: {}", chunk.chunk_id, e);
            return fail_chunk(db, metrics, chunk.chunk_id, "processing panicked").await;
        }
    };

    let segments = clamp_spans(&spans, chunk.duration_sec);

    let stitch = StitchConfig::from_secs(config.silence_gap_sec, config.max_dialogue_sec);
    match db.commit_chunk_results(&chunk, &segments, stitch).await {
        Ok(outcome) => {
            metrics.incr_done();
            metrics.add_segments(outcome.segments_written as u64);
            metrics.add_dialogues_opened(outcome.dialogues_opened as u64);
            metrics.add_dialogues_extended(outcome.dialogues_extended as u64);
            metrics.add_dialogues_closed(outcome.dialogues_closed as u64);
            log::info!(
                "Chunk {} done: {} segment(s), {} dialogue(s) opened, {} extended",
                chunk.chunk_id,
                outcome.segments_written,
                outcome.dialogues_opened,
                outcome.dialogues_extended
            );
            true
        }
        Err(e) => {
            // Nothing was persisted; the stuck-timeout path will requeue.
            log::error!(
                "Chunk {} commit failed, leaving in PROCESSING for recovery: {:#}",
                chunk.chunk_id,
                e
            );
            false
        }
    }
}

/// Read the chunk file, retrying transient I/O errors with exponential
/// backoff starting at `retry_delay`.
async fn read_with_retry(path: &Path, config: &WorkerConfig) -> Result<Vec<u8>> {
    let mut delay = config.retry_delay();

    for attempt in 0..=config.max_retries {
        match tokio::fs::read(path).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) if attempt < config.max_retries => {
                log::warn!(
                    "Read attempt {}/{} for {:?} failed: {}; retrying in {:?}",
                    attempt + 1,
                    config.max_retries + 1,
                    path,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {:?}", path));
            }
        }
    }

    unreachable!("retry loop always returns");
}

/// Mark a chunk ERROR. Returns whether the device's remaining chunks may
/// continue: true when the terminal state landed, false when even that write
/// failed and the chunk is still PROCESSING.
async fn fail_chunk(
    db: &Database,
    metrics: &Arc<WorkerMetrics>,
    chunk_id: Uuid,
    reason: &str,
) -> bool {
    let reason: String = reason.chars().take(MAX_ERROR_REASON_LEN).collect();
    if let Err(e) = db.mark_chunk_error(chunk_id, &reason).await {
        // Leave it PROCESSING; recovery will requeue and retry from scratch.
        log::error!("Failed to mark chunk {} as errored: {:#}", chunk_id, e);
        return false;
    }
    metrics.incr_errored();
    true
}

/// Clamp spans to the chunk's declared duration and convert to the
/// (start_ms, end_ms) pairs the repository persists. Spans starting past the
/// declared end are dropped entirely.
fn clamp_spans(spans: &[SpeechSpan], duration_sec: i32) -> Vec<(i32, i32)> {
    let duration_ms = duration_sec.saturating_mul(1000);
    spans
        .iter()
        .filter(|span| (span.start_ms as i32) < duration_ms)
        .map(|span| {
            (
                span.start_ms as i32,
                (span.end_ms as i32).min(duration_ms),
            )
        })
        .filter(|(start, end)| end > start)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_drops_and_truncates_out_of_range_spans() {
        let spans = [
            SpeechSpan {
                start_ms: 0,
                end_ms: 900,
            },
            SpeechSpan {
                start_ms: 59_700,
                end_ms: 60_300,
            },
            SpeechSpan {
                start_ms: 60_000,
                end_ms: 60_600,
            },
        ];

        let clamped = clamp_spans(&spans, 60);
        assert_eq!(clamped, vec![(0, 900), (59_700, 60_000)]);
    }

    #[test]
    fn clamp_passes_in_range_spans_through() {
        let spans = [SpeechSpan {
            start_ms: 1_000,
            end_ms: 5_020,
        }];
        assert_eq!(clamp_spans(&spans, 60), vec![(1_000, 5_020)]);
    }
}
