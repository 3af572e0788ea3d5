//! # keel-core
//!
//! Core abstractions for the Keel distributed task ledger.
//!
//! This crate provides the foundational types used across all Keel components:
//!
//! - **Worker Identity**: Stable per-process identity derived from the
//!   deployment environment
//! - **Observability**: Structured logging setup and span constructors
//!
//! ## Example
//!
//! ```rust
//! use keel_core::identity::WorkerIdentity;
//!
//! let identity = WorkerIdentity::from_env();
//! println!("running as {}", identity.worker_id());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod identity;
pub mod observability;

pub use identity::WorkerIdentity;
