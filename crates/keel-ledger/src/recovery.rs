//! Stalled-task recovery.
//!
//! Invoked at the top of each worker iteration: tasks whose heartbeat
//! expired past the threshold (or twice the threshold for foreign owners)
//! are requeued so another worker can pick them up. Losing a requeue race to
//! another worker is expected and benign.

use std::time::Duration;

use metrics::counter;
use tracing::{debug, info};

use crate::metrics::{labels, names};
use crate::repository::Ledger;
use crate::task::TaskStatus;

/// Outcome of one stall-recovery sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stalled tasks the sweep saw.
    pub examined: usize,
    /// Tasks this worker requeued.
    pub requeued: usize,
    /// Tasks another worker recovered first.
    pub lost_races: usize,
}

/// Requeues every stalled task visible to `worker_id`.
///
/// Self-owned tasks stall after `threshold`; tasks owned by other workers
/// stall after `2x threshold`, giving the original owner a grace period.
///
/// # Errors
///
/// Returns the first repository error; individual requeue races are not
/// errors.
pub async fn recover_stalled_tasks<L: Ledger + ?Sized>(
    ledger: &L,
    threshold: Duration,
    worker_id: &str,
) -> crate::error::Result<SweepReport> {
    let stalled = ledger.get_stalled_tasks(threshold, worker_id).await?;
    let mut report = SweepReport {
        examined: stalled.len(),
        ..SweepReport::default()
    };

    for task in &stalled {
        let owner = task.worker_pod_id.as_deref();
        let reason = if owner == Some(worker_id) {
            "Task stalled in current worker".to_string()
        } else {
            format!("Task stalled in worker {}", owner.unwrap_or("unknown"))
        };

        if ledger
            .requeue_task(&task.task_id, TaskStatus::Queued, &reason)
            .await?
        {
            report.requeued += 1;
            info!(task_id = %task.task_id, owner = owner.unwrap_or("unknown"), "requeued stalled task");
            counter!(names::STALLED_REQUEUED_TOTAL, labels::RESULT => "won").increment(1);
        } else {
            report.lost_races += 1;
            debug!(task_id = %task.task_id, "stalled task already recovered elsewhere");
            counter!(names::STALLED_REQUEUED_TOTAL, labels::RESULT => "lost").increment(1);
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::MemoryLedger;
    use crate::task::Task;
    use chrono::Utc;

    async fn seed_running(
        ledger: &MemoryLedger,
        task_id: &str,
        owner: &str,
        heartbeat_age: chrono::Duration,
    ) {
        let mut task = Task::new(task_id, "body").with_status(TaskStatus::Running);
        task.worker_pod_id = Some(owner.to_string());
        task.worker_node_id = Some("node-1".to_string());
        task.last_heartbeat = Some(Utc::now() - heartbeat_age);
        task.locked_at = Some(Utc::now() - heartbeat_age);
        ledger.upsert_task(&task).await.expect("seed");
    }

    #[tokio::test]
    async fn sweep_requeues_dead_workers_tasks() {
        let ledger = MemoryLedger::new();
        seed_running(&ledger, "t-dead", "dead-worker", chrono::Duration::hours(2)).await;
        seed_running(&ledger, "t-live", "live-worker", chrono::Duration::seconds(1)).await;

        let report = recover_stalled_tasks(&ledger, Duration::from_secs(300), "self-worker")
            .await
            .expect("sweep");

        assert_eq!(report.examined, 1);
        assert_eq!(report.requeued, 1);
        assert_eq!(report.lost_races, 0);

        let recovered = ledger
            .get_by_task_id("t-dead")
            .await
            .expect("get")
            .expect("task");
        assert_eq!(recovered.status, TaskStatus::Queued);
        assert!(recovered.worker_pod_id.is_none());
        assert!(recovered.worker_node_id.is_none());
        assert!(recovered.last_heartbeat.is_none());
        assert!(recovered.locked_at.is_none());
        assert_eq!(
            recovered.error_message.as_deref(),
            Some("Task stalled in worker dead-worker")
        );
    }

    #[tokio::test]
    async fn self_owned_tasks_use_the_self_reason() {
        let ledger = MemoryLedger::new();
        seed_running(&ledger, "t-mine", "self-worker", chrono::Duration::minutes(10)).await;

        let report = recover_stalled_tasks(&ledger, Duration::from_secs(300), "self-worker")
            .await
            .expect("sweep");
        assert_eq!(report.requeued, 1);

        let recovered = ledger
            .get_by_task_id("t-mine")
            .await
            .expect("get")
            .expect("task");
        assert_eq!(
            recovered.error_message.as_deref(),
            Some("Task stalled in current worker")
        );
    }

    #[tokio::test]
    async fn losing_the_requeue_race_is_benign() {
        let ledger = MemoryLedger::new();
        seed_running(&ledger, "t-1", "dead-worker", chrono::Duration::hours(2)).await;

        // First requeue wins the race; the second caller observes false.
        assert!(ledger
            .requeue_task("t-1", TaskStatus::Queued, "recovered elsewhere")
            .await
            .expect("requeue"));
        assert!(!ledger
            .requeue_task("t-1", TaskStatus::Queued, "too late")
            .await
            .expect("requeue"));

        // A recovered task no longer appears in the sweep at all.
        let report = recover_stalled_tasks(&ledger, Duration::from_secs(300), "self-worker")
            .await
            .expect("sweep");
        assert_eq!(report, SweepReport::default());
    }
}
