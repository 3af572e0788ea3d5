//! The ledger repository: atomic task state transitions.
//!
//! This module provides:
//!
//! - [`Ledger`]: Trait exposing the coordination fabric
//! - [`MongoLedger`](mongo::MongoLedger): Production MongoDB implementation
//! - [`MemoryLedger`](memory::MemoryLedger): In-memory implementation for
//!   testing and development
//!
//! ## Design Principles
//!
//! - **Atomic claims**: Acquisition is a single find-and-modify; two
//!   concurrent callers see at most one success
//! - **CAS semantics**: Status, heartbeat, and retry updates are keyed by
//!   `(taskId, version)`; a mismatch is a `false` return, never an error
//! - **Version discipline**: Every guarded mutation increments `version` by
//!   exactly 1 and refreshes `updatedAt`

pub mod memory;
pub mod mongo;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::task::{Task, TaskStatus};

/// Storage abstraction over the tasks collection.
///
/// All operations are idempotent when retried with the same
/// `(taskId, expectedVersion)` tuple. Implementations must guarantee that
/// [`try_acquire_task`](Ledger::try_acquire_task) is a single atomic
/// operation: for any set of concurrent callers with the same arguments, at
/// most one observes a non-`None` result per candidate task.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from the
/// worker's heartbeat and processing activities.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Binds to the collection and ensures the unique ascending index on
    /// `taskId`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Initialization`](crate::error::Error::Initialization)
    /// if the index cannot be built or the server is unreachable within the
    /// configured connect timeout.
    async fn initialize(&self) -> Result<()>;

    /// Inserts the task if absent (keyed by `taskId`), else replaces the
    /// whole document.
    ///
    /// On insert, an empty `id` is replaced with a fresh object id and
    /// `createdAt` is stamped; the provided `version` is preserved
    /// (default 1). On replace, `updatedAt` is refreshed and `version` is
    /// **not** incremented: this operation sits outside the
    /// optimistic-concurrency scheme and is reserved for the ingester's
    /// outbox-style persist and for test fixtures.
    ///
    /// Returns the stored task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateKey`](crate::error::Error::DuplicateKey)
    /// only when a racing insert collides on `taskId`; callers treat that as
    /// success-equivalent.
    async fn upsert_task(&self, task: &Task) -> Result<Task>;

    /// Looks up a single task by its business key.
    async fn get_by_task_id(&self, task_id: &str) -> Result<Option<Task>>;

    /// Atomically claims the oldest available task in `from` status.
    ///
    /// Matches the oldest (`createdAt` ascending) document where
    /// `status == from` and the task is unowned or its heartbeat has expired
    /// past the stale-task timeout. On a match: sets `status = to`, stamps
    /// ownership (`workerPodId`, `lastHeartbeat`, `lockedAt`), refreshes
    /// `updatedAt`, increments `version`, and returns the post-image.
    ///
    /// Returns `None` when no task matches.
    async fn try_acquire_task(
        &self,
        from: TaskStatus,
        to: TaskStatus,
        worker_id: &str,
        heartbeat_now: DateTime<Utc>,
    ) -> Result<Option<Task>>;

    /// Compare-and-sets the status, keyed by `(taskId, version)`.
    ///
    /// On a match: sets the status, increments `version`, refreshes
    /// `updatedAt`, and stamps the status-appropriate witness timestamp.
    ///
    /// Returns `true` iff exactly one document was modified.
    async fn update_status_if_version_matches(
        &self,
        task_id: &str,
        expected_version: i64,
        new_status: TaskStatus,
    ) -> Result<bool>;

    /// As [`update_status_if_version_matches`](Ledger::update_status_if_version_matches),
    /// plus an atomic `errorMessage` write.
    async fn update_status_and_error_if_version_matches(
        &self,
        task_id: &str,
        expected_version: i64,
        new_status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<bool>;

    /// Refreshes the heartbeat, keyed by `(taskId, version)` and
    /// additionally requiring `workerPodId == worker_id`: a worker may not
    /// refresh another worker's lock. Increments `version`.
    async fn update_heartbeat_if_version_matches(
        &self,
        task_id: &str,
        expected_version: i64,
        worker_id: &str,
        heartbeat: DateTime<Utc>,
    ) -> Result<bool>;

    /// Records a retry: compare-and-sets the status with the given reason as
    /// `errorMessage` and increments `retryCount` by 1 in the same atomic
    /// write.
    async fn record_retry_if_version_matches(
        &self,
        task_id: &str,
        expected_version: i64,
        new_status: TaskStatus,
        reason: &str,
    ) -> Result<bool>;

    /// Convenience: reads the current version, then compare-and-sets the
    /// status.
    ///
    /// Non-atomic across the read and the write; callers that require strict
    /// linearizability must use
    /// [`update_status_if_version_matches`](Ledger::update_status_if_version_matches)
    /// directly.
    async fn try_update_task_status(&self, task_id: &str, new_status: TaskStatus) -> Result<bool> {
        match self.get_by_task_id(task_id).await? {
            Some(task) => {
                self.update_status_if_version_matches(task_id, task.version, new_status)
                    .await
            }
            None => Ok(false),
        }
    }

    /// Finds `Running` tasks whose worker looks dead.
    ///
    /// A task qualifies when it is owned by `self_worker_id` and its
    /// heartbeat expired past `threshold`, or owned by another worker and
    /// expired past `2x threshold`. The amplification gives the original
    /// owner a grace period before another worker reclaims the task.
    ///
    /// Sorted by `lastHeartbeat` ascending.
    async fn get_stalled_tasks(
        &self,
        threshold: Duration,
        self_worker_id: &str,
    ) -> Result<Vec<Task>>;

    /// Releases ownership of a `Running` task and moves it back to a waiting
    /// status.
    ///
    /// Matches only when `status == Running`. Clears `workerPodId`,
    /// `workerNodeId`, `lastHeartbeat`, and `lockedAt`; sets the status and
    /// `errorMessage = reason`; increments `version`.
    ///
    /// Returns `true` iff one document was updated; `false` means another
    /// worker already recovered it, which is benign.
    async fn requeue_task(
        &self,
        task_id: &str,
        new_status: TaskStatus,
        reason: &str,
    ) -> Result<bool>;

    /// Liveness probe.
    ///
    /// # Errors
    ///
    /// Returns
    /// [`Error::DatabaseUnavailable`](crate::error::Error::DatabaseUnavailable)
    /// if the server is unreachable.
    async fn ping(&self) -> Result<()>;
}
