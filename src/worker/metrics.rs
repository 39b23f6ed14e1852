// Worker metrics
// Atomic counters reset at each log-interval boundary; lifecycle is the
// process, so a plain shared struct is enough.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct WorkerMetrics {
    chunks_claimed: AtomicU64,
    chunks_done: AtomicU64,
    chunks_errored: AtomicU64,
    chunks_requeued: AtomicU64,
    segments_written: AtomicU64,
    dialogues_opened: AtomicU64,
    dialogues_extended: AtomicU64,
    dialogues_closed: AtomicU64,
}

/// Point-in-time copy of the counters since the last reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub chunks_claimed: u64,
    pub chunks_done: u64,
    pub chunks_errored: u64,
    pub chunks_requeued: u64,
    pub segments_written: u64,
    pub dialogues_opened: u64,
    pub dialogues_extended: u64,
    pub dialogues_closed: u64,
}

impl MetricsSnapshot {
    pub fn is_empty(&self) -> bool {
        self.chunks_claimed == 0
            && self.chunks_done == 0
            && self.chunks_errored == 0
            && self.chunks_requeued == 0
    }
}

impl WorkerMetrics {
    pub fn add_claimed(&self, n: u64) {
        self.chunks_claimed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr_done(&self) {
        self.chunks_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_errored(&self) {
        self.chunks_errored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_requeued(&self, n: u64) {
        self.chunks_requeued.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_segments(&self, n: u64) {
        self.segments_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_dialogues_opened(&self, n: u64) {
        self.dialogues_opened.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_dialogues_extended(&self, n: u64) {
        self.dialogues_extended.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_dialogues_closed(&self, n: u64) {
        self.dialogues_closed.fetch_add(n, Ordering::Relaxed);
    }

    /// Read and zero every counter in one pass.
    pub fn snapshot_and_reset(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            chunks_claimed: self.chunks_claimed.swap(0, Ordering::Relaxed),
            chunks_done: self.chunks_done.swap(0, Ordering::Relaxed),
            chunks_errored: self.chunks_errored.swap(0, Ordering::Relaxed),
            chunks_requeued: self.chunks_requeued.swap(0, Ordering::Relaxed),
            segments_written: self.segments_written.swap(0, Ordering::Relaxed),
            dialogues_opened: self.dialogues_opened.swap(0, Ordering::Relaxed),
            dialogues_extended: self.dialogues_extended.swap(0, Ordering::Relaxed),
            dialogues_closed: self.dialogues_closed.swap(0, Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_resets_counters() {
        let metrics = WorkerMetrics::default();
        metrics.add_claimed(3);
        metrics.incr_done();
        metrics.incr_done();
        metrics.incr_errored();
        metrics.add_segments(7);

        let first = metrics.snapshot_and_reset();
        assert_eq!(first.chunks_claimed, 3);
        assert_eq!(first.chunks_done, 2);
        assert_eq!(first.chunks_errored, 1);
        assert_eq!(first.segments_written, 7);
        assert!(!first.is_empty());

        let second = metrics.snapshot_and_reset();
        assert!(second.is_empty());
        assert_eq!(second.segments_written, 0);
    }
}
