//! Scheduler traffic counters.
//!
//! Enabled with the `metrics` feature. Counters are updated with relaxed
//! atomics on the recording and worker threads and read through
//! `Metrics::snapshot`, exposed as `Scheduler::metrics()`.

#[cfg(feature = "metrics")]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "metrics")]
use std::time::Instant;

/// Optional counters describing scheduler traffic.
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct Metrics {
    /// Commands recorded into chunks (immediate-mode executions excluded).
    pub commands_recorded: AtomicU64,
    /// Chunks handed to the submission worker.
    pub chunks_flushed: AtomicU64,
    /// Chunks replayed by the submission worker.
    pub chunks_executed: AtomicU64,
    /// Chunks created because the recycle pool was empty.
    pub chunks_allocated: AtomicU64,
    /// Records that overflowed the current chunk and forced a flush.
    pub chunk_overflows: AtomicU64,
    /// Fence waits that could not take the fast path.
    pub fence_waits_blocked: AtomicU64,
    /// Time when metrics collection started.
    pub start_time: Instant,
}

#[cfg(feature = "metrics")]
impl Metrics {
    /// Creates a new metrics instance.
    pub fn new() -> Self {
        Self {
            commands_recorded: AtomicU64::new(0),
            chunks_flushed: AtomicU64::new(0),
            chunks_executed: AtomicU64::new(0),
            chunks_allocated: AtomicU64::new(0),
            chunk_overflows: AtomicU64::new(0),
            fence_waits_blocked: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Returns a snapshot of current metrics values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commands_recorded: self.commands_recorded.load(Ordering::Relaxed),
            chunks_flushed: self.chunks_flushed.load(Ordering::Relaxed),
            chunks_executed: self.chunks_executed.load(Ordering::Relaxed),
            chunks_allocated: self.chunks_allocated.load(Ordering::Relaxed),
            chunk_overflows: self.chunk_overflows.load(Ordering::Relaxed),
            fence_waits_blocked: self.fence_waits_blocked.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(feature = "metrics")]
impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[cfg(feature = "metrics")]
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub commands_recorded: u64,
    pub chunks_flushed: u64,
    pub chunks_executed: u64,
    pub chunks_allocated: u64,
    pub chunk_overflows: u64,
    pub fence_waits_blocked: u64,
    pub elapsed_seconds: f64,
}

#[cfg(feature = "metrics")]
impl MetricsSnapshot {
    /// Average number of commands carried per flushed chunk.
    pub fn commands_per_chunk(&self) -> f64 {
        if self.chunks_flushed > 0 {
            self.commands_recorded as f64 / self.chunks_flushed as f64
        } else {
            0.0
        }
    }

    /// Chunks flushed but not yet replayed.
    pub fn chunks_in_flight(&self) -> i64 {
        self.chunks_flushed as i64 - self.chunks_executed as i64
    }
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.commands_recorded, 0);
        assert_eq!(snapshot.chunks_flushed, 0);
        assert_eq!(snapshot.chunks_executed, 0);
        assert_eq!(snapshot.chunk_overflows, 0);
        assert!(snapshot.elapsed_seconds >= 0.0);
    }

    #[test]
    fn test_metrics_derived_values() {
        let metrics = Metrics::new();
        metrics.commands_recorded.fetch_add(30, Ordering::Relaxed);
        metrics.chunks_flushed.fetch_add(3, Ordering::Relaxed);
        metrics.chunks_executed.fetch_add(2, Ordering::Relaxed);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.commands_per_chunk(), 10.0);
        assert_eq!(snapshot.chunks_in_flight(), 1);
    }
}
