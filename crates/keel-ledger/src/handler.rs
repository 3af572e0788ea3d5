//! Task handler trait and test implementations.
//!
//! The handler is the user-supplied business logic the worker invokes for
//! each acquired task. Handlers report failures through [`HandlerError`],
//! whose `retryable` flag drives the failure classifier.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::task::Task;

/// Handler error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandlerErrorCategory {
    /// Error in user business code.
    UserCode,
    /// Input payload failed validation.
    DataQuality,
    /// Network, storage, or timeout.
    Infrastructure,
    /// Invalid configuration or missing secrets.
    Configuration,
    /// Unknown error category.
    Unknown,
}

impl Default for HandlerErrorCategory {
    fn default() -> Self {
        Self::Unknown
    }
}

/// A failure reported by a task handler.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{message}")]
pub struct HandlerError {
    /// Error category.
    pub category: HandlerErrorCategory,
    /// Error message.
    pub message: String,
    /// Whether another attempt may succeed.
    pub retryable: bool,
}

impl HandlerError {
    /// Creates a new handler error.
    ///
    /// Infrastructure errors default to retryable; everything else defaults
    /// to terminal.
    #[must_use]
    pub fn new(category: HandlerErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            retryable: matches!(category, HandlerErrorCategory::Infrastructure),
        }
    }

    /// Creates a retryable error with an unknown category.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            category: HandlerErrorCategory::Unknown,
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a terminal error with an unknown category.
    #[must_use]
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            category: HandlerErrorCategory::Unknown,
            message: message.into(),
            retryable: false,
        }
    }

    /// Sets whether the error is retryable.
    #[must_use]
    pub const fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

/// Result type returned by task handlers.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// User-supplied business logic invoked once per acquired task.
///
/// Implementations should be idempotent: the ledger guarantees at most one
/// concurrent execution per task, but a crash after the handler finishes and
/// before the status transition commits leads to a second attempt.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Executes the business logic for one task.
    async fn handle(&self, task: &Task) -> HandlerResult;
}

/// A no-op handler that immediately succeeds.
#[derive(Debug, Default)]
pub struct NoOpHandler;

#[async_trait]
impl TaskHandler for NoOpHandler {
    async fn handle(&self, _task: &Task) -> HandlerResult {
        Ok(())
    }
}

/// A handler that always fails with a configurable error.
#[derive(Debug)]
pub struct FailingHandler {
    error: HandlerError,
}

impl FailingHandler {
    /// Creates a new failing handler with the given error.
    #[must_use]
    pub const fn new(error: HandlerError) -> Self {
        Self { error }
    }
}

#[async_trait]
impl TaskHandler for FailingHandler {
    async fn handle(&self, _task: &Task) -> HandlerResult {
        Err(self.error.clone())
    }
}
