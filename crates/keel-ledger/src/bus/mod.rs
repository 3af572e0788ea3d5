//! Message-bus abstraction consumed by the ingester.
//!
//! This module provides:
//!
//! - [`MessageBus`]: Trait for the capability set the ingester needs
//! - [`BusMessage`]: The received-message shape with per-delivery lock state
//! - [`MemoryBus`](memory::MemoryBus): In-memory bus for testing
//!
//! ## Design Principles
//!
//! - **Broker agnostic**: Same interface for MNS queues, Service Bus
//!   queues/topics, or local test buses
//! - **At-least-once**: A message stays locked until settled; abandonment or
//!   lock expiry redelivers it
//! - **Cancellation-aware**: The long-poll receive takes the caller's
//!   shutdown token and returns promptly when it fires
//! - **Lock-lost is not fatal**: Settlement after the broker released the
//!   lock surfaces as
//!   [`Error::LockLost`](crate::error::Error::LockLost) and means "the
//!   message will come back"

pub mod memory;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub use memory::MemoryBus;

/// A message received from the bus, locked to this consumer until settled.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Broker-assigned message identifier; doubles as the task business key.
    pub message_id: String,
    /// Payload decoded as UTF-8 (lossy).
    pub body: String,
    /// Raw payload bytes.
    pub body_bytes: Bytes,
    /// When the broker first accepted the message.
    pub enqueued_time: DateTime<Utc>,
    /// Opaque settlement token for this delivery.
    pub receipt_handle: String,
    /// How many times the message has been delivered, this delivery
    /// included.
    pub delivery_count: u32,
    /// Application properties carried with the message.
    pub properties: HashMap<String, String>,
    /// Subscription the message arrived on, for topic sources.
    pub subscription_name: Option<String>,
}

/// The bus capability surface the ingester consumes.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync`; the ingester settles messages from
/// concurrent per-message futures.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Receives up to `max_messages`, waiting at most `max_wait` for the
    /// first.
    ///
    /// Returns an empty batch when nothing arrived in time. Implementations
    /// must honor `cancel` while waiting: when the token fires, return
    /// promptly with whatever was already taken (usually nothing) instead of
    /// sitting out the long poll. Messages returned this way are still
    /// locked and will redeliver once their lock expires.
    async fn receive_messages(
        &self,
        max_messages: usize,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<BusMessage>>;

    /// Acknowledges successful processing; permanently removes the message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockLost`](crate::error::Error::LockLost) when the
    /// broker already released the lock; the message will be redelivered.
    async fn complete(&self, message: &BusMessage) -> Result<()>;

    /// Releases the lock so the message is redelivered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockLost`](crate::error::Error::LockLost) when the
    /// broker already released the lock.
    async fn abandon(&self, message: &BusMessage) -> Result<()>;

    /// Moves the message to the poison store with the given reason.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockLost`](crate::error::Error::LockLost) when the
    /// broker already released the lock.
    async fn dead_letter(&self, message: &BusMessage, reason: &str) -> Result<()>;

    /// Returns the queue or topic name, used for task metadata and spans.
    fn source_name(&self) -> &str;

    /// Returns the subscription name, for topic sources.
    fn subscription_name(&self) -> Option<&str> {
        None
    }
}
