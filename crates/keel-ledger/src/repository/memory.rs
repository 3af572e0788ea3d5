//! In-memory ledger implementation for testing and development.
//!
//! Mirrors every semantic contract of the MongoDB implementation over a
//! `RwLock`'d map: atomic acquisition, version-guarded updates, stall
//! discovery with the 2x foreign-owner amplification, and requeue cleanup.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No persistence, no distribution
//! - **Single-process only**: Tasks are not visible across process
//!   boundaries

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::Ledger;
use crate::config::DEFAULT_STALE_TASK_TIMEOUT;
use crate::error::{Error, Result};
use crate::task::{StatusWitness, Task, TaskStatus};

/// In-memory ledger for tests.
///
/// Thread-safe via an `RwLock`; writes mutate whole `Task` values so every
/// guarded update is atomic with respect to concurrent acquirers.
#[derive(Debug)]
pub struct MemoryLedger {
    tasks: RwLock<HashMap<String, Task>>,
    stale_task_timeout: Duration,
}

/// Converts a lock poison error to a database error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::database("ledger lock poisoned")
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    /// Creates an empty ledger with the default stale-task timeout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            stale_task_timeout: DEFAULT_STALE_TASK_TIMEOUT,
        }
    }

    /// Creates an empty ledger with a custom stale-task timeout.
    #[must_use]
    pub fn with_stale_task_timeout(stale_task_timeout: Duration) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            stale_task_timeout,
        }
    }

    /// Returns a snapshot of every stored task.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn all_tasks(&self) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().map_err(poison_err)?;
        Ok(tasks.values().cloned().collect())
    }

    /// Returns the number of stored tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        let tasks = self.tasks.read().map_err(poison_err)?;
        Ok(tasks.len())
    }

    /// Returns true if the ledger holds no tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn apply_witness(task: &mut Task, status: TaskStatus, now: DateTime<Utc>) {
        match status.witness() {
            Some(StatusWitness::Processed) => task.processed_at = Some(now),
            Some(StatusWitness::Completed) => task.completed_at = Some(now),
            Some(StatusWitness::Failed) => task.failed_at = Some(now),
            None => {}
        }
    }
}

fn cutoff(now: DateTime<Utc>, threshold: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(threshold)
        .ok()
        .and_then(|threshold| now.checked_sub_signed(threshold))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn upsert_task(&self, task: &Task) -> Result<Task> {
        let mut tasks = self.tasks.write().map_err(poison_err)?;
        let now = Utc::now();

        if let Some(existing) = tasks.get(&task.task_id) {
            if !task.id.is_empty() && task.id != existing.id {
                return Err(Error::DuplicateKey {
                    task_id: task.task_id.clone(),
                });
            }
            // Whole-document replace; the primary key is immutable and
            // version is deliberately left alone.
            let mut replacement = task.clone();
            replacement.id = existing.id.clone();
            replacement.updated_at = now;
            tasks.insert(replacement.task_id.clone(), replacement.clone());
            return Ok(replacement);
        }

        let mut inserted = task.clone();
        if inserted.id.is_empty() {
            inserted.id = Task::generate_id();
            inserted.created_at = now;
        }
        inserted.updated_at = now;
        tasks.insert(inserted.task_id.clone(), inserted.clone());
        Ok(inserted)
    }

    async fn get_by_task_id(&self, task_id: &str) -> Result<Option<Task>> {
        let tasks = self.tasks.read().map_err(poison_err)?;
        Ok(tasks.get(task_id).cloned())
    }

    async fn try_acquire_task(
        &self,
        from: TaskStatus,
        to: TaskStatus,
        worker_id: &str,
        heartbeat_now: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        let mut tasks = self.tasks.write().map_err(poison_err)?;
        let now = Utc::now();
        let stale_cutoff = cutoff(now, self.stale_task_timeout);

        let candidate = tasks
            .values()
            .filter(|task| task.status == from)
            .filter(|task| {
                task.worker_pod_id.is_none()
                    || task
                        .last_heartbeat
                        .is_some_and(|heartbeat| heartbeat < stale_cutoff)
            })
            .min_by_key(|task| (task.created_at, task.task_id.clone()))
            .map(|task| task.task_id.clone());

        let Some(task_id) = candidate else {
            return Ok(None);
        };

        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::database("acquired task vanished"))?;
        task.status = to;
        task.worker_pod_id = Some(worker_id.to_string());
        task.last_heartbeat = Some(heartbeat_now);
        task.locked_at = Some(now);
        task.updated_at = now;
        task.version += 1;

        Ok(Some(task.clone()))
    }

    async fn update_status_if_version_matches(
        &self,
        task_id: &str,
        expected_version: i64,
        new_status: TaskStatus,
    ) -> Result<bool> {
        self.update_status_and_error_if_version_matches(task_id, expected_version, new_status, None)
            .await
    }

    async fn update_status_and_error_if_version_matches(
        &self,
        task_id: &str,
        expected_version: i64,
        new_status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let mut tasks = self.tasks.write().map_err(poison_err)?;
        let Some(task) = tasks.get_mut(task_id) else {
            return Ok(false);
        };
        if task.version != expected_version {
            return Ok(false);
        }

        let now = Utc::now();
        task.status = new_status;
        if let Some(message) = error_message {
            task.error_message = Some(message.to_string());
        }
        Self::apply_witness(task, new_status, now);
        task.updated_at = now;
        task.version += 1;
        Ok(true)
    }

    async fn update_heartbeat_if_version_matches(
        &self,
        task_id: &str,
        expected_version: i64,
        worker_id: &str,
        heartbeat: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tasks = self.tasks.write().map_err(poison_err)?;
        let Some(task) = tasks.get_mut(task_id) else {
            return Ok(false);
        };
        if task.version != expected_version || task.worker_pod_id.as_deref() != Some(worker_id) {
            return Ok(false);
        }

        task.last_heartbeat = Some(heartbeat);
        task.updated_at = Utc::now();
        task.version += 1;
        Ok(true)
    }

    async fn record_retry_if_version_matches(
        &self,
        task_id: &str,
        expected_version: i64,
        new_status: TaskStatus,
        reason: &str,
    ) -> Result<bool> {
        let mut tasks = self.tasks.write().map_err(poison_err)?;
        let Some(task) = tasks.get_mut(task_id) else {
            return Ok(false);
        };
        if task.version != expected_version {
            return Ok(false);
        }

        let now = Utc::now();
        task.status = new_status;
        task.error_message = Some(reason.to_string());
        task.retry_count += 1;
        Self::apply_witness(task, new_status, now);
        task.updated_at = now;
        task.version += 1;
        Ok(true)
    }

    async fn get_stalled_tasks(
        &self,
        threshold: Duration,
        self_worker_id: &str,
    ) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().map_err(poison_err)?;
        let now = Utc::now();
        let self_cutoff = cutoff(now, threshold);
        let foreign_cutoff = cutoff(now, threshold.saturating_mul(2));

        let mut stalled: Vec<Task> = tasks
            .values()
            .filter(|task| task.status == TaskStatus::Running)
            .filter(|task| {
                let cutoff = if task.worker_pod_id.as_deref() == Some(self_worker_id) {
                    self_cutoff
                } else {
                    foreign_cutoff
                };
                task.last_heartbeat
                    .is_some_and(|heartbeat| heartbeat < cutoff)
            })
            .cloned()
            .collect();

        stalled.sort_by_key(|task| task.last_heartbeat);
        Ok(stalled)
    }

    async fn requeue_task(
        &self,
        task_id: &str,
        new_status: TaskStatus,
        reason: &str,
    ) -> Result<bool> {
        let mut tasks = self.tasks.write().map_err(poison_err)?;
        let Some(task) = tasks.get_mut(task_id) else {
            return Ok(false);
        };
        if task.status != TaskStatus::Running {
            return Ok(false);
        }

        task.clear_ownership();
        task.status = new_status;
        task.error_message = Some(reason.to_string());
        task.updated_at = Utc::now();
        task.version += 1;
        Ok(true)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed(ledger: &MemoryLedger, task: Task) -> Task {
        ledger.upsert_task(&task).await.expect("upsert")
    }

    #[tokio::test]
    async fn upsert_generates_id_and_preserves_version() {
        let ledger = MemoryLedger::new();
        let stored = ledger.upsert_task(&Task::new("t-1", "body")).await.expect("upsert");
        assert!(!stored.id.is_empty());
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn replace_keeps_id_and_version() {
        let ledger = MemoryLedger::new();
        let stored = ledger.upsert_task(&Task::new("t-1", "v1")).await.expect("insert");

        let mut replacement = stored.clone();
        replacement.body = "v2".into();
        let replaced = ledger.upsert_task(&replacement).await.expect("replace");

        assert_eq!(replaced.id, stored.id);
        assert_eq!(replaced.version, stored.version);
        assert_eq!(replaced.body, "v2");
        assert_eq!(ledger.len().expect("len"), 1);
    }

    #[tokio::test]
    async fn conflicting_id_is_duplicate_key() {
        let ledger = MemoryLedger::new();
        ledger.upsert_task(&Task::new("t-1", "body")).await.expect("insert");

        let mut racing = Task::new("t-1", "other");
        racing.id = Task::generate_id();
        let err = ledger.upsert_task(&racing).await.expect_err("duplicate");
        assert!(err.is_duplicate_key());
    }

    #[tokio::test]
    async fn acquire_prefers_oldest_task() {
        let ledger = MemoryLedger::new();
        let mut old = Task::new("t-old", "body").with_status(TaskStatus::Queued);
        old.id = Task::generate_id();
        old.created_at = Utc::now() - chrono::Duration::minutes(10);
        seed(&ledger, old).await;
        seed(&ledger, Task::new("t-new", "body").with_status(TaskStatus::Queued)).await;

        let acquired = ledger
            .try_acquire_task(TaskStatus::Queued, TaskStatus::Assigned, "w-1", Utc::now())
            .await
            .expect("acquire")
            .expect("task");
        assert_eq!(acquired.task_id, "t-old");
        assert_eq!(acquired.status, TaskStatus::Assigned);
        assert_eq!(acquired.version, 2);
        assert_eq!(acquired.worker_pod_id.as_deref(), Some("w-1"));
        assert!(acquired.locked_at.is_some());
    }

    #[tokio::test]
    async fn acquire_skips_freshly_owned_tasks() {
        let ledger = MemoryLedger::new();
        let mut owned = Task::new("t-1", "body").with_status(TaskStatus::Queued);
        owned.worker_pod_id = Some("other".into());
        owned.last_heartbeat = Some(Utc::now());
        seed(&ledger, owned).await;

        let acquired = ledger
            .try_acquire_task(TaskStatus::Queued, TaskStatus::Assigned, "w-1", Utc::now())
            .await
            .expect("acquire");
        assert!(acquired.is_none());
    }

    #[tokio::test]
    async fn heartbeat_requires_matching_worker() {
        let ledger = MemoryLedger::new();
        let mut task = Task::new("t-1", "body").with_status(TaskStatus::Running);
        task.worker_pod_id = Some("w-1".into());
        let stored = seed(&ledger, task).await;

        let refreshed = ledger
            .update_heartbeat_if_version_matches(&stored.task_id, stored.version, "w-2", Utc::now())
            .await
            .expect("heartbeat");
        assert!(!refreshed);

        let refreshed = ledger
            .update_heartbeat_if_version_matches(&stored.task_id, stored.version, "w-1", Utc::now())
            .await
            .expect("heartbeat");
        assert!(refreshed);
    }

    #[tokio::test]
    async fn record_retry_bumps_count_atomically() {
        let ledger = MemoryLedger::new();
        let stored = seed(&ledger, Task::new("t-1", "body").with_status(TaskStatus::Error)).await;

        let recorded = ledger
            .record_retry_if_version_matches(
                &stored.task_id,
                stored.version,
                TaskStatus::Queued,
                "Retry attempt 1/3",
            )
            .await
            .expect("retry");
        assert!(recorded);

        let task = ledger
            .get_by_task_id(&stored.task_id)
            .await
            .expect("get")
            .expect("task");
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.version, stored.version + 1);
        assert_eq!(task.error_message.as_deref(), Some("Retry attempt 1/3"));
    }
}
