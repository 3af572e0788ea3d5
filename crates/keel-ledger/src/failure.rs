//! Failure classification for the worker's retry protocol.
//!
//! Two categories surface to the worker: transient failures count toward the
//! retry budget, terminal failures skip retries and go straight to `Failed`.

use crate::error::Error;
use crate::handler::HandlerError;

/// How a failure should be treated by the retry protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Counts toward retries; another attempt may succeed.
    Transient,
    /// Unrecoverable; skip retries and fail the task.
    Terminal,
}

/// A failure observed while processing one task.
#[derive(Debug)]
pub enum WorkerFailure {
    /// The user handler reported a failure.
    Handler(HandlerError),
    /// A ledger operation failed mid-processing.
    Ledger(Error),
    /// Processing exceeded its wall-clock deadline.
    Deadline,
}

impl std::fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handler(err) => write!(f, "{err}"),
            Self::Ledger(err) => write!(f, "{err}"),
            Self::Deadline => write!(f, "processing deadline exceeded"),
        }
    }
}

/// Classifies a worker failure for the retry protocol.
///
/// Database unavailability, lost message locks, and deadline timeouts are
/// transient. Handler failures classify by their `retryable` flag.
#[must_use]
pub fn classify(failure: &WorkerFailure) -> FailureKind {
    match failure {
        WorkerFailure::Handler(err) => {
            if err.retryable {
                FailureKind::Transient
            } else {
                FailureKind::Terminal
            }
        }
        WorkerFailure::Ledger(_) | WorkerFailure::Deadline => FailureKind::Transient,
    }
}
