// VAD/dialogue worker for SalesControl
// Four cooperating tasks over one database: the processing loop that claims
// and processes chunk batches, the recovery loop for stuck chunks, the idle
// dialogue-state sweep, and the metrics logger.

pub mod metrics;
pub mod processor;

use anyhow::Result;
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::database::Database;

use metrics::WorkerMetrics;

/// How long in-flight chunk processing may run after a shutdown signal
/// before the process exits and leaves recovery to the stuck-timeout path.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Idle dialogue-state sweep cadence.
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Run the worker until SIGTERM/SIGINT.
pub async fn run(config: WorkerConfig) -> Result<()> {
    let db = Database::connect(&config.database_url).await?;
    let config = Arc::new(config);
    let metrics = Arc::new(WorkerMetrics::default());
    let shutdown = CancellationToken::new();

    log::info!(
        "Worker starting: poll={}s batch={} vad_aggressiveness={} frame={}ms gap={}s max_dialogue={}s",
        config.poll_interval_sec,
        config.batch_size,
        config.vad_aggressiveness,
        config.vad_frame_ms,
        config.silence_gap_sec,
        config.max_dialogue_sec
    );

    let recovery_task = tokio::spawn(recovery_loop(
        db.clone(),
        config.clone(),
        metrics.clone(),
        shutdown.clone(),
    ));
    let idle_task = tokio::spawn(idle_state_loop(
        db.clone(),
        config.clone(),
        shutdown.clone(),
    ));
    let metrics_task = tokio::spawn(metrics_loop(
        metrics.clone(),
        config.metrics_log_interval(),
        shutdown.clone(),
    ));
    let processing_task = tokio::spawn(processing_loop(
        db.clone(),
        config.clone(),
        metrics.clone(),
        shutdown.clone(),
    ));

    crate::shutdown::shutdown_signal().await;
    log::info!("Shutdown signal received; draining in-flight chunks");
    shutdown.cancel();

    // The processing loop finishes its current batch; cap the wait so a hung
    // chunk cannot pin the process. Anything cut off here is requeued by the
    // stuck-timeout path of whichever worker runs next.
    match tokio::time::timeout(SHUTDOWN_GRACE, processing_task).await {
        Ok(Ok(())) => log::info!("Processing loop drained cleanly"),
        Ok(Err(e)) => log::error!("Processing loop panicked: {}", e),
        Err(_) => log::warn!(
            "Grace window of {:?} expired with chunks in flight; exiting",
            SHUTDOWN_GRACE
        ),
    }

    recovery_task.abort();
    idle_task.abort();
    metrics_task.abort();

    let last = metrics.snapshot_and_reset();
    if !last.is_empty() {
        log::info!(
            "Final interval: claimed={} done={} errored={} requeued={}",
            last.chunks_claimed,
            last.chunks_done,
            last.chunks_errored,
            last.chunks_requeued
        );
    }

    log::info!("Worker stopped");
    Ok(())
}

/// Claim batches every poll interval and process them. Stops claiming as
/// soon as shutdown is requested; the batch in flight still completes its
/// commit.
async fn processing_loop(
    db: Database,
    config: Arc<WorkerConfig>,
    metrics: Arc<WorkerMetrics>,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(config.poll_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let claimed = match db.claim_chunks(config.batch_size).await {
            Ok(chunks) => chunks,
            Err(e) => {
                log::error!("Claim failed: {:#}", e);
                continue;
            }
        };

        if claimed.is_empty() {
            continue;
        }

        log::debug!("Claimed {} chunk(s)", claimed.len());
        metrics.add_claimed(claimed.len() as u64);
        processor::process_batch(&db, &config, &metrics, claimed).await;
    }
}

/// Requeue chunks stuck in PROCESSING past the stuck timeout.
async fn recovery_loop(
    db: Database,
    config: Arc<WorkerConfig>,
    metrics: Arc<WorkerMetrics>,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(config.recovery_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        match db.requeue_stuck_chunks(config.stuck_timeout_sec).await {
            Ok(0) => {}
            Ok(requeued) => {
                metrics.add_requeued(requeued);
                log::warn!(
                    "Recovered {} chunk(s) stuck in PROCESSING for over {}s",
                    requeued,
                    config.stuck_timeout_sec
                );
            }
            Err(e) => log::error!("Stuck-chunk recovery failed: {:#}", e),
        }
    }
}

/// Close dialogue-state rows for devices that stopped uploading entirely, so
/// an open dialogue cannot linger for hours without a triggering chunk.
async fn idle_state_loop(db: Database, config: Arc<WorkerConfig>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(IDLE_SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let threshold = ChronoDuration::seconds(config.dialogue_idle_close_sec as i64);
        match db.close_idle_dialogue_states(threshold).await {
            Ok(0) => {}
            Ok(closed) => log::info!("Closed {} idle dialogue state(s)", closed),
            Err(e) => log::error!("Idle dialogue sweep failed: {:#}", e),
        }
    }
}

/// Emit one metrics line per interval and reset the counters.
async fn metrics_loop(
    metrics: Arc<WorkerMetrics>,
    log_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(log_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Skip the immediate first tick so the first line covers a full interval.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let snapshot = metrics.snapshot_and_reset();
        log::info!(
            "Metrics: claimed={} done={} errored={} requeued={} segments={} dialogues_opened={} extended={} closed={}",
            snapshot.chunks_claimed,
            snapshot.chunks_done,
            snapshot.chunks_errored,
            snapshot.chunks_requeued,
            snapshot.segments_written,
            snapshot.dialogues_opened,
            snapshot.dialogues_extended,
            snapshot.dialogues_closed
        );
    }
}
