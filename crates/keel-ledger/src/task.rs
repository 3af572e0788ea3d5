//! Task entity and status model.
//!
//! This module provides:
//! - `Task`: The single mutable ledger record, one per logical work item
//! - `TaskStatus`: The state-machine position with stable wire codes
//! - `StatusWitness`: Which timestamp a committed transition stamps
//!
//! Consumers treat tasks as immutable: all mutations happen through the
//! version-guarded repository operations in [`crate::repository`].

use std::collections::HashMap;

use bson::oid::ObjectId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::schema;

/// Task lifecycle position.
///
/// Each variant carries a stable numeric code for wire compatibility with
/// other readers of the ledger; the persisted form is the PascalCase name.
///
/// ```text
///   ingester lane:  Pending → Created → Processing → (Completed | Failed)
///   worker lane:    Completed → Queued → Assigned → Running
///                       → (Succeeded | Error → Queued* | Failed)
///   terminal:       Succeeded, Failed, Cancelled, Archived, Deleted
/// ```
///
/// Stall recovery always routes abandoned tasks back through `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Accepted but not yet persisted durably.
    Pending,
    /// Durably recorded, not yet picked up.
    Created,
    /// The ingester is persisting and dispatching the source message.
    Processing,
    /// Ingestion finished; eligible for promotion into the worker lane.
    Completed,
    /// Ingestion failed permanently.
    Failed,
    /// Waiting for a worker to claim it.
    Queued,
    /// Claimed by a worker, not yet executing.
    Assigned,
    /// A worker is actively executing it.
    Running,
    /// Handler finished successfully.
    Succeeded,
    /// Handler failed; the retry protocol decides what happens next.
    Error,
    /// Scheduled for another attempt.
    Retrying,
    /// Cancelled by an operator.
    Cancelled,
    /// Execution exceeded its deadline.
    Timeout,
    /// Retained for audit only.
    Archived,
    /// Marked for removal; retention is delegated.
    Deleted,
}

impl TaskStatus {
    /// Returns the stable numeric wire code.
    #[must_use]
    pub const fn code(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Created => 1,
            Self::Processing => 10,
            Self::Completed => 11,
            Self::Failed => 12,
            Self::Queued => 20,
            Self::Assigned => 21,
            Self::Running => 22,
            Self::Succeeded => 23,
            Self::Error => 24,
            Self::Retrying => 25,
            Self::Cancelled => 26,
            Self::Timeout => 27,
            Self::Archived => 90,
            Self::Deleted => 91,
        }
    }

    /// Resolves a wire code back to a status.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Pending),
            1 => Some(Self::Created),
            10 => Some(Self::Processing),
            11 => Some(Self::Completed),
            12 => Some(Self::Failed),
            20 => Some(Self::Queued),
            21 => Some(Self::Assigned),
            22 => Some(Self::Running),
            23 => Some(Self::Succeeded),
            24 => Some(Self::Error),
            25 => Some(Self::Retrying),
            26 => Some(Self::Cancelled),
            27 => Some(Self::Timeout),
            90 => Some(Self::Archived),
            91 => Some(Self::Deleted),
            _ => None,
        }
    }

    /// Returns the persisted name of this status.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Created => "Created",
            Self::Processing => "Processing",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Queued => "Queued",
            Self::Assigned => "Assigned",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Error => "Error",
            Self::Retrying => "Retrying",
            Self::Cancelled => "Cancelled",
            Self::Timeout => "Timeout",
            Self::Archived => "Archived",
            Self::Deleted => "Deleted",
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Created => "created",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Error => "error",
            Self::Retrying => "retrying",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::Archived => "archived",
            Self::Deleted => "deleted",
        }
    }

    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::Archived | Self::Deleted
        )
    }

    /// Returns the timestamp a transition into this status must stamp.
    #[must_use]
    pub const fn witness(&self) -> Option<StatusWitness> {
        match self {
            Self::Processing => Some(StatusWitness::Processed),
            Self::Completed | Self::Succeeded => Some(StatusWitness::Completed),
            Self::Failed | Self::Error => Some(StatusWitness::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Which transition-witness timestamp a status transition stamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWitness {
    /// Stamps `processedAt`.
    Processed,
    /// Stamps `completedAt`.
    Completed,
    /// Stamps `failedAt`.
    Failed,
}

impl StatusWitness {
    /// Returns the persisted field name for this witness.
    #[must_use]
    pub const fn field(&self) -> &'static str {
        match self {
            Self::Processed => schema::fields::PROCESSED_AT,
            Self::Completed => schema::fields::COMPLETED_AT,
            Self::Failed => schema::fields::FAILED_AT,
        }
    }
}

/// The ledger record for one logical work item.
///
/// Unique by `task_id`; owned by the worker named in `worker_pod_id` while
/// `status` is `Assigned` or `Running`. `version` is the optimistic
/// concurrency token: every committed mutation increments it by exactly 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Storage primary key, a 24-hex object id. Empty until first upsert.
    #[serde(rename = "_id")]
    pub id: String,
    /// Business key, globally unique.
    pub task_id: String,
    /// Opaque work input.
    pub body: String,
    /// State-machine position.
    pub status: TaskStatus,
    /// Optimistic-concurrency token, starts at 1.
    pub version: i64,
    /// Attempts consumed.
    pub retry_count: u32,
    /// Identity of the worker currently holding the task.
    pub worker_pod_id: Option<String>,
    /// Node hosting that worker.
    pub worker_node_id: Option<String>,
    /// Liveness beacon.
    #[serde(with = "schema::optional_bson_datetime")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// When the current holder acquired the task.
    #[serde(with = "schema::optional_bson_datetime")]
    pub locked_at: Option<DateTime<Utc>>,
    /// When the record was inserted.
    #[serde(with = "schema::bson_datetime")]
    pub created_at: DateTime<Utc>,
    /// When the record was last written.
    #[serde(with = "schema::bson_datetime")]
    pub updated_at: DateTime<Utc>,
    /// Witness for entering `Processing`.
    #[serde(with = "schema::optional_bson_datetime")]
    pub processed_at: Option<DateTime<Utc>>,
    /// Witness for entering `Completed` or `Succeeded`.
    #[serde(with = "schema::optional_bson_datetime")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Witness for entering `Failed` or `Error`.
    #[serde(with = "schema::optional_bson_datetime")]
    pub failed_at: Option<DateTime<Utc>>,
    /// Last failure reason.
    pub error_message: Option<String>,
    /// Free-form annotations (source topic, subscription, etc.).
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Task {
    /// Creates a new task in `Pending` with version 1.
    #[must_use]
    pub fn new(task_id: impl Into<String>, body: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            task_id: task_id.into(),
            body: body.into(),
            status: TaskStatus::Pending,
            version: 1,
            retry_count: 0,
            worker_pod_id: None,
            worker_node_id: None,
            last_heartbeat: None,
            locked_at: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
            completed_at: None,
            failed_at: None,
            error_message: None,
            metadata: HashMap::new(),
        }
    }

    /// Sets the initial status.
    #[must_use]
    pub const fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Generates a fresh 24-hex storage id.
    #[must_use]
    pub fn generate_id() -> String {
        ObjectId::new().to_hex()
    }

    /// Returns true if the task is owned by a worker right now.
    #[must_use]
    pub fn is_owned(&self) -> bool {
        matches!(self.status, TaskStatus::Assigned | TaskStatus::Running)
            && self.worker_pod_id.is_some()
    }

    /// Clears all ownership fields (used by requeue).
    pub fn clear_ownership(&mut self) {
        self.worker_pod_id = None;
        self.worker_node_id = None;
        self.last_heartbeat = None;
        self.locked_at = None;
    }
}
