//! The worker loop: acquire, heartbeat, process, transition, retry.
//!
//! One `Worker` runs per process. Each iteration recovers stalled tasks,
//! acquires a batch, and processes every acquired task under a cancellation
//! scope composed from the process-wide shutdown signal and a per-task
//! deadline. A heartbeat ticker runs concurrently with each processing call
//! and re-reads the task for a fresh version on every tick.
//!
//! On shutdown the in-flight task is left owned; stall recovery reclaims it
//! once its heartbeat expires.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, histogram};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use keel_core::identity::WorkerIdentity;

use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::failure::{classify, FailureKind, WorkerFailure};
use crate::handler::TaskHandler;
use crate::metrics::{labels, names, record_transition, TimingGuard};
use crate::recovery::{recover_stalled_tasks, SweepReport};
use crate::repository::Ledger;
use crate::task::{Task, TaskStatus};

/// Outcome of one worker iteration.
#[derive(Debug, Clone, Copy, Default)]
pub struct IterationReport {
    /// Stall-recovery outcome.
    pub sweep: SweepReport,
    /// Tasks acquired this iteration.
    pub acquired: usize,
    /// Tasks that reached `Succeeded`.
    pub succeeded: usize,
    /// Tasks that did not (failed, retried, or lost ownership).
    pub failed: usize,
}

enum ProcessOutcome {
    Succeeded,
    Failed(WorkerFailure),
    Deadline,
    Cancelled,
}

/// A task-processing worker with a stable identity.
pub struct Worker<L, H> {
    ledger: Arc<L>,
    handler: Arc<H>,
    identity: WorkerIdentity,
    worker_id: String,
    config: WorkerConfig,
}

impl<L, H> Worker<L, H>
where
    L: Ledger + 'static,
    H: TaskHandler + 'static,
{
    /// Creates a worker over the given ledger and handler.
    #[must_use]
    pub fn new(
        ledger: Arc<L>,
        handler: Arc<H>,
        identity: WorkerIdentity,
        config: WorkerConfig,
    ) -> Self {
        let worker_id = identity.worker_id();
        Self {
            ledger,
            handler,
            identity,
            worker_id,
            config,
        }
    }

    /// Returns the rendered worker id.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Returns the worker identity.
    #[must_use]
    pub const fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    /// Runs the loop until `shutdown` fires.
    ///
    /// Iteration errors are logged and the loop continues after the polling
    /// sleep; only shutdown ends the loop.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok` on shutdown; the `Result` keeps the
    /// signature stable for hosts that treat loop exit as fallible.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(worker_id = %self.worker_id, "worker started");
        loop {
            match self.execute_once(&shutdown).await {
                Ok(report) => {
                    if report.acquired > 0 || report.sweep.requeued > 0 {
                        debug!(
                            acquired = report.acquired,
                            succeeded = report.succeeded,
                            failed = report.failed,
                            requeued = report.sweep.requeued,
                            "iteration finished"
                        );
                    }
                }
                Err(Error::Cancelled) => break,
                Err(err) => error!(error = %err, "worker iteration failed"),
            }

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.config.polling_interval) => {}
            }
        }
        info!(worker_id = %self.worker_id, "worker stopped");
        Ok(())
    }

    /// Runs a single iteration: recover stalled tasks, acquire a batch,
    /// process it.
    ///
    /// This is the entrypoint for hosts that drive the worker from an
    /// external scheduler instead of [`run`](Worker::run).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] when shutdown fired mid-batch (the
    /// in-flight task is left to stall recovery) and repository errors from
    /// the sweep or acquisition.
    #[instrument(skip_all, fields(worker_id = %self.worker_id))]
    pub async fn execute_once(&self, shutdown: &CancellationToken) -> Result<IterationReport> {
        let _timing = TimingGuard::new(|elapsed| {
            histogram!(names::WORKER_ITERATION_SECONDS).record(elapsed.as_secs_f64());
        });

        let sweep = recover_stalled_tasks(
            self.ledger.as_ref(),
            self.config.stale_task_timeout,
            &self.worker_id,
        )
        .await?;

        let tasks = self.acquire_batch().await?;
        let mut report = IterationReport {
            sweep,
            acquired: tasks.len(),
            ..IterationReport::default()
        };

        for task in tasks {
            if shutdown.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if self.process_task(task, shutdown).await? {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }
        }

        Ok(report)
    }

    /// Acquires up to `batch_size` tasks.
    ///
    /// Each slot first promotes an ingester-completed task into the worker
    /// lane (`Completed -> Queued`), then falls back to claiming a waiting
    /// task (`Queued -> Assigned`). The loop stops at the first empty slot
    /// rather than draining aggressively.
    async fn acquire_batch(&self) -> Result<Vec<Task>> {
        let mut acquired = Vec::new();
        for _ in 0..self.config.batch_size {
            let now = Utc::now();
            let promoted = self
                .ledger
                .try_acquire_task(TaskStatus::Completed, TaskStatus::Queued, &self.worker_id, now)
                .await?;
            let task = match promoted {
                Some(task) => Some(task),
                None => {
                    self.ledger
                        .try_acquire_task(
                            TaskStatus::Queued,
                            TaskStatus::Assigned,
                            &self.worker_id,
                            now,
                        )
                        .await?
                }
            };

            match task {
                Some(task) => {
                    counter!(
                        names::TASKS_ACQUIRED_TOTAL,
                        labels::TO_STATUS => task.status.as_label(),
                    )
                    .increment(1);
                    acquired.push(task);
                }
                None => break,
            }
        }
        Ok(acquired)
    }

    /// Processes one acquired task; returns true when it reached
    /// `Succeeded`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] when shutdown fired during processing.
    async fn process_task(&self, mut task: Task, shutdown: &CancellationToken) -> Result<bool> {
        // Promoted tasks step Queued -> Assigned so the status chain never
        // skips a state; both steps bump the version by exactly 1.
        if task.status == TaskStatus::Queued {
            if !self.cas_step(&mut task, TaskStatus::Assigned).await? {
                return Ok(false);
            }
        }
        if task.status == TaskStatus::Assigned {
            if !self.cas_step(&mut task, TaskStatus::Running).await? {
                return Ok(false);
            }
        }

        let heartbeat_cancel = shutdown.child_token();
        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.ledger),
            task.task_id.clone(),
            self.worker_id.clone(),
            self.config.heartbeat_interval,
            heartbeat_cancel.clone(),
        ));

        let outcome = tokio::select! {
            () = shutdown.cancelled() => ProcessOutcome::Cancelled,
            () = tokio::time::sleep(self.config.stale_task_timeout) => ProcessOutcome::Deadline,
            result = self.handler.handle(&task) => match result {
                Ok(()) => ProcessOutcome::Succeeded,
                Err(err) => ProcessOutcome::Failed(WorkerFailure::Handler(err)),
            },
        };

        heartbeat_cancel.cancel();
        let _ = heartbeat.await;

        match outcome {
            ProcessOutcome::Succeeded => {
                let transitioned = self
                    .ledger
                    .try_update_task_status(&task.task_id, TaskStatus::Succeeded)
                    .await?;
                if transitioned {
                    record_transition(TaskStatus::Running.as_label(), TaskStatus::Succeeded.as_label());
                } else {
                    warn!(task_id = %task.task_id, "task changed hands before success could commit");
                }
                Ok(transitioned)
            }
            ProcessOutcome::Failed(failure) => {
                self.handle_failure(&task.task_id, &failure).await?;
                Ok(false)
            }
            ProcessOutcome::Deadline => {
                warn!(task_id = %task.task_id, "processing deadline exceeded");
                self.handle_failure(&task.task_id, &WorkerFailure::Deadline)
                    .await?;
                Ok(false)
            }
            ProcessOutcome::Cancelled => {
                info!(task_id = %task.task_id, "shutdown during processing; leaving task to stall recovery");
                Err(Error::Cancelled)
            }
        }
    }

    /// Applies one version-guarded status step and mirrors it locally.
    async fn cas_step(&self, task: &mut Task, to: TaskStatus) -> Result<bool> {
        let stepped = self
            .ledger
            .update_status_if_version_matches(&task.task_id, task.version, to)
            .await?;
        if stepped {
            record_transition(task.status.as_label(), to.as_label());
            task.status = to;
            task.version += 1;
        } else {
            debug!(task_id = %task.task_id, to = %to, "lost ownership before status step");
        }
        Ok(stepped)
    }

    /// The failure sub-protocol: mark `Error`, then retry or fail
    /// permanently.
    ///
    /// Version mismatches abort without retrying; the task is no longer
    /// ours.
    async fn handle_failure(&self, task_id: &str, failure: &WorkerFailure) -> Result<()> {
        let Some(current) = self.ledger.get_by_task_id(task_id).await? else {
            return Ok(());
        };

        let cause = failure.to_string();
        let marked = self
            .ledger
            .update_status_and_error_if_version_matches(
                task_id,
                current.version,
                TaskStatus::Error,
                Some(&cause),
            )
            .await?;
        if !marked {
            debug!(task_id, "version changed while marking failure; task is no longer ours");
            return Ok(());
        }
        record_transition(TaskStatus::Running.as_label(), TaskStatus::Error.as_label());

        let Some(current) = self.ledger.get_by_task_id(task_id).await? else {
            return Ok(());
        };

        let transient = classify(failure) == FailureKind::Transient;
        if transient && current.retry_count < self.config.max_retries {
            let reason = format!(
                "Retry attempt {}/{}",
                current.retry_count + 1,
                self.config.max_retries
            );
            let requeued = self
                .ledger
                .record_retry_if_version_matches(
                    task_id,
                    current.version,
                    TaskStatus::Queued,
                    &reason,
                )
                .await?;
            if requeued {
                info!(task_id, attempt = current.retry_count + 1, "task queued for retry");
                record_transition(TaskStatus::Error.as_label(), TaskStatus::Queued.as_label());
            } else {
                debug!(task_id, "lost the retry race; leaving task alone");
            }
        } else {
            let message = format!(
                "Failed permanently after {} retries: {cause}",
                current.retry_count
            );
            let failed = self
                .ledger
                .update_status_and_error_if_version_matches(
                    task_id,
                    current.version,
                    TaskStatus::Failed,
                    Some(&message),
                )
                .await?;
            if failed {
                warn!(task_id, retries = current.retry_count, "task failed permanently");
                record_transition(TaskStatus::Error.as_label(), TaskStatus::Failed.as_label());
            } else {
                debug!(task_id, "lost the terminal-failure race; leaving task alone");
            }
        }

        Ok(())
    }
}

/// Refreshes the task heartbeat every `interval` until cancelled.
///
/// Each tick re-reads the task for a fresh version rather than caching one:
/// the processing activity and other workers bump the version concurrently.
/// A version mismatch means an authoritative change happened elsewhere
/// (likely stall recovery); the ticker logs it and stops.
async fn heartbeat_loop<L: Ledger>(
    ledger: Arc<L>,
    task_id: String,
    worker_id: String,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the first refresh should wait a
    // full period.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let current = match ledger.get_by_task_id(&task_id).await {
                    Ok(Some(current)) => current,
                    Ok(None) => {
                        warn!(task_id, "heartbeat target vanished");
                        break;
                    }
                    Err(err) => {
                        warn!(task_id, error = %err, "heartbeat read failed");
                        continue;
                    }
                };

                match ledger
                    .update_heartbeat_if_version_matches(
                        &task_id,
                        current.version,
                        &worker_id,
                        Utc::now(),
                    )
                    .await
                {
                    Ok(true) => {
                        counter!(names::HEARTBEATS_TOTAL, labels::RESULT => "ok").increment(1);
                    }
                    Ok(false) => {
                        warn!(task_id, "heartbeat version mismatch; dropping ownership");
                        counter!(names::HEARTBEATS_TOTAL, labels::RESULT => "miss").increment(1);
                        break;
                    }
                    Err(err) => {
                        warn!(task_id, error = %err, "heartbeat update failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{FailingHandler, HandlerError, NoOpHandler};
    use crate::repository::memory::MemoryLedger;

    fn test_worker<H: TaskHandler + 'static>(
        ledger: Arc<MemoryLedger>,
        handler: H,
        config: WorkerConfig,
    ) -> Worker<MemoryLedger, H> {
        Worker::new(
            ledger,
            Arc::new(handler),
            WorkerIdentity::new("node-1", "pod-a", "i-1"),
            config,
        )
    }

    #[tokio::test]
    async fn acquire_batch_stops_at_first_empty_slot() {
        let ledger = Arc::new(MemoryLedger::new());
        for n in 0..3 {
            ledger
                .upsert_task(&Task::new(format!("t-{n}"), "body").with_status(TaskStatus::Queued))
                .await
                .expect("seed");
        }

        let worker = test_worker(
            Arc::clone(&ledger),
            NoOpHandler,
            WorkerConfig::default().with_batch_size(10),
        );
        let batch = worker.acquire_batch().await.expect("acquire");
        assert_eq!(batch.len(), 3);
        for task in &batch {
            assert_eq!(task.status, TaskStatus::Assigned);
            assert_eq!(task.worker_pod_id.as_deref(), Some(worker.worker_id()));
        }
    }

    #[tokio::test]
    async fn promotion_claims_completed_tasks_first() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger
            .upsert_task(&Task::new("t-done", "body").with_status(TaskStatus::Completed))
            .await
            .expect("seed");

        let worker = test_worker(
            Arc::clone(&ledger),
            NoOpHandler,
            WorkerConfig::default().with_batch_size(1),
        );
        let batch = worker.acquire_batch().await.expect("acquire");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].status, TaskStatus::Queued);
        assert_eq!(batch[0].version, 2);
    }

    #[tokio::test]
    async fn handle_failure_requeues_transient_under_budget() {
        let ledger = Arc::new(MemoryLedger::new());
        let mut task = Task::new("t-1", "body").with_status(TaskStatus::Running);
        task.worker_pod_id = Some("node-1-pod-a-i-1".into());
        ledger.upsert_task(&task).await.expect("seed");

        let worker = test_worker(Arc::clone(&ledger), NoOpHandler, WorkerConfig::default());
        worker
            .handle_failure(
                "t-1",
                &WorkerFailure::Handler(HandlerError::transient("boom")),
            )
            .await
            .expect("failure protocol");

        let task = ledger.get_by_task_id("t-1").await.expect("get").expect("task");
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.error_message.as_deref(), Some("Retry attempt 1/3"));
        assert!(task.failed_at.is_some());
    }

    #[tokio::test]
    async fn handle_failure_terminal_goes_straight_to_failed() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger
            .upsert_task(&Task::new("t-1", "body").with_status(TaskStatus::Running))
            .await
            .expect("seed");

        let worker = test_worker(Arc::clone(&ledger), NoOpHandler, WorkerConfig::default());
        worker
            .handle_failure(
                "t-1",
                &WorkerFailure::Handler(HandlerError::terminal("unprocessable")),
            )
            .await
            .expect("failure protocol");

        let task = ledger.get_by_task_id("t-1").await.expect("get").expect("task");
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 0);
        assert_eq!(
            task.error_message.as_deref(),
            Some("Failed permanently after 0 retries: unprocessable")
        );
    }

    #[tokio::test]
    async fn cancelled_processing_leaves_task_owned() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger
            .upsert_task(&Task::new("t-1", "body").with_status(TaskStatus::Queued))
            .await
            .expect("seed");

        // Handler that never finishes on its own.
        struct BlockingHandler;
        #[async_trait::async_trait]
        impl TaskHandler for BlockingHandler {
            async fn handle(&self, _task: &Task) -> crate::handler::HandlerResult {
                std::future::pending::<()>().await;
                Ok(())
            }
        }

        let worker = test_worker(Arc::clone(&ledger), BlockingHandler, WorkerConfig::default());
        let shutdown = CancellationToken::new();
        let canceller = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = worker.execute_once(&shutdown).await;
        assert!(matches!(result, Err(Error::Cancelled)));

        let task = ledger.get_by_task_id("t-1").await.expect("get").expect("task");
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.worker_pod_id.as_deref(), Some(worker.worker_id()));
    }

    #[tokio::test]
    async fn failing_worker_records_the_cause() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger
            .upsert_task(&Task::new("t-1", "body").with_status(TaskStatus::Queued))
            .await
            .expect("seed");

        let worker = test_worker(
            Arc::clone(&ledger),
            FailingHandler::new(HandlerError::transient("socket reset")),
            WorkerConfig::default(),
        );
        let shutdown = CancellationToken::new();
        let report = worker.execute_once(&shutdown).await.expect("iteration");
        assert_eq!(report.acquired, 1);
        assert_eq!(report.failed, 1);

        let task = ledger.get_by_task_id("t-1").await.expect("get").expect("task");
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.error_message.as_deref(), Some("Retry attempt 1/3"));
    }
}
