//! Configuration for the ledger, worker, and ingester components.
//!
//! Explicit structs passed to constructors; no service-locator globals. Every
//! value is overridable and carries the documented default. The `from_env`
//! constructors are conveniences for host binaries; embedded deployments
//! build the structs directly.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default heartbeat-expiry threshold for acquisition (5 minutes).
pub const DEFAULT_STALE_TASK_TIMEOUT: Duration = Duration::from_secs(300);
/// Default worker heartbeat period (30 seconds).
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Default worker idle sleep (10 seconds).
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(10);
/// Default bus long-poll wait (30 seconds).
pub const DEFAULT_POLLING_WAIT: Duration = Duration::from_secs(30);
/// Default acquisition/receive batch cap.
pub const DEFAULT_BATCH_SIZE: usize = 10;
/// Default worker retry budget per task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default connect/server-selection timeout (10 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the MongoDB-backed ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerConfig {
    /// MongoDB URI.
    pub connection_string: String,
    /// Database holding the tasks collection.
    pub database_name: String,
    /// Collection name.
    pub collection_name: String,
    /// Heartbeat-expiry threshold for acquisition.
    #[serde(with = "humantime_serde")]
    pub stale_task_timeout: Duration,
    /// Connect and server-selection timeout.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl LedgerConfig {
    /// Creates a config for the given URI and database with defaults.
    #[must_use]
    pub fn new(connection_string: impl Into<String>, database_name: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            database_name: database_name.into(),
            collection_name: "tasks".to_string(),
            stale_task_timeout: DEFAULT_STALE_TASK_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Sets the collection name.
    #[must_use]
    pub fn with_collection_name(mut self, name: impl Into<String>) -> Self {
        self.collection_name = name.into();
        self
    }

    /// Sets the stale-task timeout.
    #[must_use]
    pub const fn with_stale_task_timeout(mut self, timeout: Duration) -> Self {
        self.stale_task_timeout = timeout;
        self
    }

    /// Sets the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Builds the config from `KEEL_MONGODB_URI` and `KEEL_DATABASE`,
    /// with `KEEL_COLLECTION` and `KEEL_STALE_TASK_TIMEOUT_SECS` optional.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when a required variable is missing
    /// or a numeric override does not parse.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::new(
            required_env("KEEL_MONGODB_URI")?,
            required_env("KEEL_DATABASE")?,
        );
        if let Some(collection) = optional_env("KEEL_COLLECTION") {
            config.collection_name = collection;
        }
        if let Some(secs) = optional_secs("KEEL_STALE_TASK_TIMEOUT_SECS")? {
            config.stale_task_timeout = secs;
        }
        if let Some(secs) = optional_secs("KEEL_CONNECT_TIMEOUT_SECS")? {
            config.connect_timeout = secs;
        }
        Ok(config)
    }
}

/// Configuration for the worker loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Idle sleep between iterations.
    #[serde(with = "humantime_serde")]
    pub polling_interval: Duration,
    /// Heartbeat period while processing.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Maximum tasks acquired per iteration.
    pub batch_size: usize,
    /// Retry budget per task.
    pub max_retries: u32,
    /// Per-task processing deadline and stall-recovery threshold.
    #[serde(with = "humantime_serde")]
    pub stale_task_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            polling_interval: DEFAULT_POLLING_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            stale_task_timeout: DEFAULT_STALE_TASK_TIMEOUT,
        }
    }
}

impl WorkerConfig {
    /// Sets the polling interval.
    #[must_use]
    pub const fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the acquisition batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the stale-task timeout.
    #[must_use]
    pub const fn with_stale_task_timeout(mut self, timeout: Duration) -> Self {
        self.stale_task_timeout = timeout;
        self
    }

    /// Builds the config from `KEEL_*` environment overrides on top of the
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when a numeric override does not
    /// parse.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(secs) = optional_secs("KEEL_POLLING_INTERVAL_SECS")? {
            config.polling_interval = secs;
        }
        if let Some(secs) = optional_secs("KEEL_HEARTBEAT_INTERVAL_SECS")? {
            config.heartbeat_interval = secs;
        }
        if let Some(value) = optional_parsed::<usize>("KEEL_BATCH_SIZE")? {
            config.batch_size = value;
        }
        if let Some(value) = optional_parsed::<u32>("KEEL_MAX_RETRIES")? {
            config.max_retries = value;
        }
        if let Some(secs) = optional_secs("KEEL_STALE_TASK_TIMEOUT_SECS")? {
            config.stale_task_timeout = secs;
        }
        Ok(config)
    }
}

/// Configuration for the ingestion pull loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestConfig {
    /// Maximum messages received per tick.
    pub batch_size: usize,
    /// Bus long-poll wait, also the idle sleep between empty ticks.
    #[serde(with = "humantime_serde")]
    pub polling_wait: Duration,
    /// Dead-letter failed messages instead of abandoning them.
    pub dead_letter_failed_messages: bool,
    /// Skip the inline handler and leave tasks for the worker subsystem.
    pub store_and_forward: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            polling_wait: DEFAULT_POLLING_WAIT,
            dead_letter_failed_messages: true,
            store_and_forward: false,
        }
    }
}

impl IngestConfig {
    /// Sets the receive batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the long-poll wait.
    #[must_use]
    pub const fn with_polling_wait(mut self, wait: Duration) -> Self {
        self.polling_wait = wait;
        self
    }

    /// Sets the failed-message disposition.
    #[must_use]
    pub const fn with_dead_letter_failed_messages(mut self, dead_letter: bool) -> Self {
        self.dead_letter_failed_messages = dead_letter;
        self
    }

    /// Enables store-and-forward mode.
    #[must_use]
    pub const fn with_store_and_forward(mut self, store_and_forward: bool) -> Self {
        self.store_and_forward = store_and_forward;
        self
    }
}

fn required_env(key: &str) -> Result<String> {
    env::var(key).map_err(|_| Error::configuration(format!("missing {key}")))
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

fn optional_parsed<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    optional_env(key)
        .map(|value| {
            value
                .parse::<T>()
                .map_err(|_| Error::configuration(format!("invalid {key}: {value}")))
        })
        .transpose()
}

fn optional_secs(key: &str) -> Result<Option<Duration>> {
    Ok(optional_parsed::<u64>(key)?.map(Duration::from_secs))
}
