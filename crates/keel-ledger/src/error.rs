//! Error types for the task ledger domain.
//!
//! Driver-level connection and timeout failures are translated into the
//! single [`Error::DatabaseOperation`] kind carrying the original cause;
//! callers above the repository never pattern-match on driver types.
//!
//! A version mismatch on a compare-and-set update is **not** an error: the
//! repository signals it through a `false` return and callers log and move
//! on.

/// The result type used throughout keel-ledger.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Ledger startup failed; the host must terminate.
    #[error("ledger initialization failed: {message}")]
    Initialization {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A repository operation failed at the driver level.
    #[error("database operation failed: {message}")]
    DatabaseOperation {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The database did not answer a liveness probe.
    #[error("database unavailable: {message}")]
    DatabaseUnavailable {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A racing insert produced a duplicate business key.
    ///
    /// Callers treat this as success-equivalent: the task is durable either
    /// way.
    #[error("duplicate task id: {task_id}")]
    DuplicateKey {
        /// The business key that collided.
        task_id: String,
    },

    /// The broker released a message lock before settlement.
    ///
    /// The message will be redelivered; callers log and move on.
    #[error("message lock lost: {message_id}")]
    LockLost {
        /// The message whose lock was lost.
        message_id: String,
    },

    /// A message-bus operation failed.
    #[error("bus operation failed: {message}")]
    Bus {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Shutdown was requested while work was in flight.
    #[error("shutdown requested")]
    Cancelled,

    /// A configuration value was missing or malformed.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Description of what made the configuration invalid.
        message: String,
    },
}

impl Error {
    /// Creates a new initialization error.
    #[must_use]
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new initialization error with a source.
    #[must_use]
    pub fn initialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Initialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new database operation error.
    #[must_use]
    pub fn database(message: impl Into<String>) -> Self {
        Self::DatabaseOperation {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new database operation error with a source.
    #[must_use]
    pub fn database_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::DatabaseOperation {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new bus error.
    #[must_use]
    pub fn bus(message: impl Into<String>) -> Self {
        Self::Bus {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Returns true if this error indicates a lost message lock.
    #[must_use]
    pub const fn is_lock_lost(&self) -> bool {
        matches!(self, Self::LockLost { .. })
    }

    /// Returns true if this error is the duplicate-key race, which callers
    /// treat as success-equivalent.
    #[must_use]
    pub const fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey { .. })
    }
}
