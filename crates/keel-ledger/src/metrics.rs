//! Observability metrics for the ledger, worker, and ingester.
//!
//! Metrics are exposed via the `metrics` crate facade; the host installs the
//! exporter (e.g. Prometheus). Names and labels live in constant modules so
//! dashboards and alerts have a single source of truth.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `keel_task_transitions_total` | Counter | `from_status`, `to_status` | Committed status transitions |
//! | `keel_worker_tasks_acquired_total` | Counter | `to_status` | Successful acquisitions |
//! | `keel_worker_heartbeats_total` | Counter | `result` | Heartbeat refresh outcomes |
//! | `keel_worker_stalled_requeued_total` | Counter | `result` | Stall-sweep requeue outcomes |
//! | `keel_worker_iteration_duration_seconds` | Histogram | - | Worker iteration wall clock |
//! | `keel_ingest_messages_total` | Counter | `source`, `result` | Ingested message outcomes |
//! | `keel_ingest_tick_duration_seconds` | Histogram | `source` | Ingest tick wall clock |

use std::time::{Duration, Instant};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: committed task status transitions.
    pub const TASK_TRANSITIONS_TOTAL: &str = "keel_task_transitions_total";
    /// Counter: successful task acquisitions.
    pub const TASKS_ACQUIRED_TOTAL: &str = "keel_worker_tasks_acquired_total";
    /// Counter: heartbeat refresh outcomes.
    pub const HEARTBEATS_TOTAL: &str = "keel_worker_heartbeats_total";
    /// Counter: stall-sweep requeue outcomes.
    pub const STALLED_REQUEUED_TOTAL: &str = "keel_worker_stalled_requeued_total";
    /// Histogram: worker iteration wall clock in seconds.
    pub const WORKER_ITERATION_SECONDS: &str = "keel_worker_iteration_duration_seconds";
    /// Counter: ingested message outcomes.
    pub const INGEST_MESSAGES_TOTAL: &str = "keel_ingest_messages_total";
    /// Histogram: ingest tick wall clock in seconds.
    pub const INGEST_TICK_SECONDS: &str = "keel_ingest_tick_duration_seconds";
}

/// Label keys used across metrics.
pub mod labels {
    /// Previous task status (for transitions).
    pub const FROM_STATUS: &str = "from_status";
    /// Target task status (for transitions).
    pub const TO_STATUS: &str = "to_status";
    /// Outcome of an operation (ok, miss, won, lost, success, failure).
    pub const RESULT: &str = "result";
    /// Queue or topic the work came from.
    pub const SOURCE: &str = "source";
}

/// Observes elapsed wall-clock time when dropped.
///
/// ```rust
/// use keel_ledger::metrics::TimingGuard;
///
/// let _guard = TimingGuard::new(|elapsed| {
///     metrics::histogram!("keel_worker_iteration_duration_seconds")
///         .record(elapsed.as_secs_f64());
/// });
/// // ... timed work
/// ```
pub struct TimingGuard<F: FnOnce(Duration)> {
    started: Instant,
    observe: Option<F>,
}

impl<F: FnOnce(Duration)> TimingGuard<F> {
    /// Starts timing; `observe` runs on drop with the elapsed duration.
    #[must_use]
    pub fn new(observe: F) -> Self {
        Self {
            started: Instant::now(),
            observe: Some(observe),
        }
    }
}

impl<F: FnOnce(Duration)> Drop for TimingGuard<F> {
    fn drop(&mut self) {
        if let Some(observe) = self.observe.take() {
            observe(self.started.elapsed());
        }
    }
}

/// Records a committed status transition.
pub fn record_transition(from: &'static str, to: &'static str) {
    metrics::counter!(
        names::TASK_TRANSITIONS_TOTAL,
        labels::FROM_STATUS => from,
        labels::TO_STATUS => to,
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn timing_guard_observes_on_drop() {
        let observed = AtomicBool::new(false);
        {
            let _guard = TimingGuard::new(|elapsed| {
                observed.store(true, Ordering::SeqCst);
                assert!(elapsed >= Duration::ZERO);
            });
        }
        assert!(observed.load(Ordering::SeqCst));
    }

    #[test]
    fn record_transition_does_not_panic_without_recorder() {
        record_transition("queued", "assigned");
    }
}
