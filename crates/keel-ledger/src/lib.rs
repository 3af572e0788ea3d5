//! # keel-ledger
//!
//! MongoDB-backed task ledger and worker coordination protocol.
//!
//! This crate implements the coordination core of Keel, providing:
//!
//! - **Durable Tasks**: One ledger record per logical work item, unique by
//!   its business key
//! - **Atomic Acquisition**: Find-and-modify claims with stale-lock takeover
//! - **Optimistic Concurrency**: Version-guarded state transitions
//! - **Worker Loop**: Acquire, heartbeat, process, retry, recover
//! - **Persist-Before-Ack Ingestion**: Bus messages become durable tasks
//!   before they are acknowledged upstream
//!
//! ## Core Concepts
//!
//! - **Task**: The unit of work persisted in the ledger
//! - **Ledger**: The `tasks` collection plus the repository API
//! - **Worker**: A process that acquires and executes tasks under a stable
//!   identity, with heartbeat-based liveness
//! - **Stall Recovery**: The periodic sweep that requeues tasks abandoned by
//!   dead workers
//!
//! ## Guarantees
//!
//! - **At-most-one execution at a time**: Concurrent acquisition of the same
//!   task yields at most one winner
//! - **At-least-once delivery**: A crash between persist and acknowledge
//!   causes a harmless idempotent re-upsert
//! - **Bounded retries**: A task that keeps failing terminates in `Failed`
//!   with the retry count recorded
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use keel_core::identity::WorkerIdentity;
//! use keel_ledger::config::WorkerConfig;
//! use keel_ledger::error::Result;
//! use keel_ledger::handler::NoOpHandler;
//! use keel_ledger::repository::memory::MemoryLedger;
//! use keel_ledger::worker::Worker;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<()> {
//! let ledger = Arc::new(MemoryLedger::new());
//! let worker = Worker::new(
//!     ledger,
//!     Arc::new(NoOpHandler),
//!     WorkerIdentity::from_env(),
//!     WorkerConfig::default(),
//! );
//!
//! let shutdown = CancellationToken::new();
//! worker.run(shutdown).await
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod bus;
pub mod config;
pub mod error;
pub mod failure;
pub mod handler;
pub mod ingest;
pub mod metrics;
pub mod recovery;
pub mod repository;
pub mod retry;
pub mod schema;
pub mod task;
pub mod worker;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::bus::{BusMessage, MemoryBus, MessageBus};
    pub use crate::config::{IngestConfig, LedgerConfig, WorkerConfig};
    pub use crate::error::{Error, Result};
    pub use crate::failure::{classify, FailureKind, WorkerFailure};
    pub use crate::handler::{HandlerError, HandlerErrorCategory, TaskHandler};
    pub use crate::ingest::{Ingester, TickReport};
    pub use crate::recovery::{recover_stalled_tasks, SweepReport};
    pub use crate::repository::memory::MemoryLedger;
    pub use crate::repository::mongo::MongoLedger;
    pub use crate::repository::Ledger;
    pub use crate::retry::retry_after;
    pub use crate::task::{Task, TaskStatus};
    pub use crate::worker::Worker;
}
