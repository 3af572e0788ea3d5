//! Observability infrastructure for Keel.
//!
//! Structured logging with consistent spans. Hosts pick the output format
//! through `KEEL_LOG_FORMAT` and verbosity through `RUST_LOG`; the span
//! constructors keep worker and ingester telemetry queryable by the same
//! field names everywhere.

use std::env;

use tracing::Span;
use tracing_subscriber::EnvFilter;

/// Environment variable selecting the log output format.
///
/// Recognized values: `json`, `pretty` (case-insensitive). Anything else
/// falls back to [`LogFormat::Pretty`].
pub const LOG_FORMAT_VAR: &str = "KEEL_LOG_FORMAT";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON structured logs with flattened event fields (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl LogFormat {
    /// Reads the format from `KEEL_LOG_FORMAT`.
    #[must_use]
    pub fn from_env() -> Self {
        match env::var(LOG_FORMAT_VAR) {
            Ok(value) if value.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at host startup, typically as
/// `init_logging(LogFormat::from_env())`. If a subscriber is already
/// installed (embedding hosts often bring their own) the call is a no-op
/// rather than an error, so library consumers may call it unconditionally.
///
/// # Environment Variables
///
/// - `KEEL_LOG_FORMAT`: Output format (`json` or `pretty`)
/// - `RUST_LOG`: Log levels (e.g. `info`, `keel_ledger=debug`); defaults to
///   `info`
///
/// # Example
///
/// ```rust
/// use keel_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::from_env());
/// ```
pub fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let already_installed = match format {
        LogFormat::Json => builder.json().flatten_event(true).try_init().is_err(),
        LogFormat::Pretty => builder.pretty().try_init().is_err(),
    };

    if already_installed {
        tracing::debug!("logging already initialized; keeping the existing subscriber");
    }
}

/// Creates a span for worker-loop operations with standard fields.
///
/// # Example
///
/// ```rust
/// use keel_core::observability::worker_span;
///
/// let span = worker_span("acquire_batch", "node-1-pod-a-i-42");
/// let _guard = span.enter();
/// // ... do worker operation
/// ```
#[must_use]
pub fn worker_span(operation: &str, worker_id: &str) -> Span {
    tracing::info_span!(
        "worker",
        op = operation,
        worker_id = worker_id,
    )
}

/// Creates a span for ingestion operations.
///
/// # Example
///
/// ```rust
/// use keel_core::observability::ingest_span;
///
/// let span = ingest_span("tick", "orders-queue");
/// let _guard = span.enter();
/// // ... do ingest operation
/// ```
#[must_use]
pub fn ingest_span(operation: &str, source: &str) -> Span {
    tracing::info_span!(
        "ingest",
        op = operation,
        source = source,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_from_env_defaults_to_pretty() {
        // KEEL_LOG_FORMAT is unset in the test environment.
        assert_eq!(LogFormat::from_env(), LogFormat::Pretty);
    }

    #[test]
    fn init_logging_tolerates_repeat_calls() {
        init_logging(LogFormat::Pretty);
        // An already-installed subscriber downgrades to a no-op.
        init_logging(LogFormat::Json);
    }

    #[test]
    fn worker_span_creates_span() {
        let span = worker_span("acquire", "node-pod-i");
        let _guard = span.enter();
        tracing::info!("test message in span");
    }

    #[test]
    fn ingest_span_creates_span() {
        let span = ingest_span("tick", "orders");
        let _guard = span.enter();
        tracing::info!("ingest message");
    }
}
