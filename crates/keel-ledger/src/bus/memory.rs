//! In-memory message bus for testing and development.
//!
//! Models the broker behaviors the ingester depends on: per-delivery receipt
//! handles, lock tracking, redelivery with an incremented delivery count on
//! abandon, a dead-letter store, and `LockLost` on settlement with a stale
//! receipt.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No persistence, no distribution
//! - **No lock expiry timer**: Locks are released only by settlement or
//!   [`MemoryBus::revoke_locks`]

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use super::{BusMessage, MessageBus};
use crate::error::{Error, Result};

/// A message waiting for delivery or sitting in flight.
#[derive(Debug, Clone)]
struct QueuedMessage {
    message_id: String,
    body: Bytes,
    enqueued_time: DateTime<Utc>,
    delivery_count: u32,
    properties: HashMap<String, String>,
}

/// A message moved to the poison store.
#[derive(Debug, Clone)]
pub struct DeadLetteredMessage {
    /// The poisoned message id.
    pub message_id: String,
    /// Payload decoded as UTF-8 (lossy).
    pub body: String,
    /// Why the message was dead-lettered.
    pub reason: String,
}

#[derive(Debug, Default)]
struct BusState {
    ready: VecDeque<QueuedMessage>,
    in_flight: HashMap<String, QueuedMessage>,
    dead_letters: Vec<DeadLetteredMessage>,
}

/// In-memory bus for tests.
#[derive(Debug)]
pub struct MemoryBus {
    name: String,
    subscription: Option<String>,
    state: Mutex<BusState>,
    notify: Notify,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::bus("bus lock poisoned")
}

impl MemoryBus {
    /// Creates an empty queue-style bus.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscription: None,
            state: Mutex::new(BusState::default()),
            notify: Notify::new(),
        }
    }

    /// Creates an empty topic-style bus with a subscription name.
    #[must_use]
    pub fn with_subscription(name: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscription: Some(subscription.into()),
            state: Mutex::new(BusState::default()),
            notify: Notify::new(),
        }
    }

    /// Publishes a message with a generated id; returns the id.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn publish(
        &self,
        body: impl Into<Bytes>,
        properties: HashMap<String, String>,
    ) -> Result<String> {
        let message_id = Ulid::new().to_string();
        self.publish_with_id(message_id.clone(), body, properties)?;
        Ok(message_id)
    }

    /// Publishes a message with an explicit id, modeling broker redelivery
    /// of the same logical message.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn publish_with_id(
        &self,
        message_id: impl Into<String>,
        body: impl Into<Bytes>,
        properties: HashMap<String, String>,
    ) -> Result<()> {
        let mut state = self.state.lock().map_err(poison_err)?;
        state.ready.push_back(QueuedMessage {
            message_id: message_id.into(),
            body: body.into(),
            enqueued_time: Utc::now(),
            delivery_count: 0,
            properties,
        });
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    /// Releases every in-flight lock back to the ready queue, modeling
    /// broker-side lock expiry. Outstanding receipts become stale.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn revoke_locks(&self) -> Result<usize> {
        let mut state = self.state.lock().map_err(poison_err)?;
        let revoked: Vec<QueuedMessage> = state.in_flight.drain().map(|(_, msg)| msg).collect();
        let count = revoked.len();
        for message in revoked {
            state.ready.push_back(message);
        }
        drop(state);
        if count > 0 {
            self.notify.notify_one();
        }
        Ok(count)
    }

    /// Returns the dead-lettered messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn dead_letters(&self) -> Result<Vec<DeadLetteredMessage>> {
        let state = self.state.lock().map_err(poison_err)?;
        Ok(state.dead_letters.clone())
    }

    /// Returns how many messages are waiting for delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn ready_len(&self) -> Result<usize> {
        let state = self.state.lock().map_err(poison_err)?;
        Ok(state.ready.len())
    }

    /// Returns how many messages are locked in flight.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn in_flight_len(&self) -> Result<usize> {
        let state = self.state.lock().map_err(poison_err)?;
        Ok(state.in_flight.len())
    }

    fn take_batch(&self, max_messages: usize) -> Result<Vec<BusMessage>> {
        let mut state = self.state.lock().map_err(poison_err)?;
        let mut batch = Vec::new();
        while batch.len() < max_messages {
            let Some(mut message) = state.ready.pop_front() else {
                break;
            };
            message.delivery_count += 1;
            let receipt_handle = Ulid::new().to_string();
            batch.push(BusMessage {
                message_id: message.message_id.clone(),
                body: String::from_utf8_lossy(&message.body).into_owned(),
                body_bytes: message.body.clone(),
                enqueued_time: message.enqueued_time,
                receipt_handle: receipt_handle.clone(),
                delivery_count: message.delivery_count,
                properties: message.properties.clone(),
                subscription_name: self.subscription.clone(),
            });
            state.in_flight.insert(receipt_handle, message);
        }
        Ok(batch)
    }

    fn settle(&self, message: &BusMessage) -> Result<QueuedMessage> {
        let mut state = self.state.lock().map_err(poison_err)?;
        state
            .in_flight
            .remove(&message.receipt_handle)
            .ok_or_else(|| Error::LockLost {
                message_id: message.message_id.clone(),
            })
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn receive_messages(
        &self,
        max_messages: usize,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<BusMessage>> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if cancel.is_cancelled() {
                return Ok(Vec::new());
            }
            let batch = self.take_batch(max_messages)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let Some(remaining) = deadline.checked_duration_since(tokio::time::Instant::now())
            else {
                return Ok(Vec::new());
            };
            tokio::select! {
                () = cancel.cancelled() => return Ok(Vec::new()),
                outcome = tokio::time::timeout(remaining, self.notify.notified()) => {
                    if outcome.is_err() {
                        return self.take_batch(max_messages);
                    }
                }
            }
        }
    }

    async fn complete(&self, message: &BusMessage) -> Result<()> {
        self.settle(message).map(|_| ())
    }

    async fn abandon(&self, message: &BusMessage) -> Result<()> {
        let released = self.settle(message)?;
        let mut state = self.state.lock().map_err(poison_err)?;
        state.ready.push_back(released);
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    async fn dead_letter(&self, message: &BusMessage, reason: &str) -> Result<()> {
        let poisoned = self.settle(message)?;
        let mut state = self.state.lock().map_err(poison_err)?;
        state.dead_letters.push(DeadLetteredMessage {
            message_id: poisoned.message_id,
            body: String::from_utf8_lossy(&poisoned.body).into_owned(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn source_name(&self) -> &str {
        &self.name
    }

    fn subscription_name(&self) -> Option<&str> {
        self.subscription.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn receive_locks_and_complete_removes() {
        let bus = MemoryBus::new("orders");
        bus.publish("payload", HashMap::new()).expect("publish");

        let batch = bus
            .receive_messages(10, Duration::from_millis(10), &CancellationToken::new())
            .await
            .expect("receive");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].delivery_count, 1);
        assert_eq!(bus.in_flight_len().expect("in flight"), 1);

        bus.complete(&batch[0]).await.expect("complete");
        assert_eq!(bus.in_flight_len().expect("in flight"), 0);
        assert_eq!(bus.ready_len().expect("ready"), 0);
    }

    #[tokio::test]
    async fn abandon_redelivers_with_bumped_count() {
        let bus = MemoryBus::new("orders");
        bus.publish("payload", HashMap::new()).expect("publish");

        let first = bus
            .receive_messages(1, Duration::from_millis(10), &CancellationToken::new())
            .await
            .expect("receive");
        bus.abandon(&first[0]).await.expect("abandon");

        let second = bus
            .receive_messages(1, Duration::from_millis(10), &CancellationToken::new())
            .await
            .expect("receive");
        assert_eq!(second[0].message_id, first[0].message_id);
        assert_eq!(second[0].delivery_count, 2);
        assert_ne!(second[0].receipt_handle, first[0].receipt_handle);
    }

    #[tokio::test]
    async fn settling_with_stale_receipt_is_lock_lost() {
        let bus = MemoryBus::new("orders");
        bus.publish("payload", HashMap::new()).expect("publish");

        let batch = bus
            .receive_messages(1, Duration::from_millis(10), &CancellationToken::new())
            .await
            .expect("receive");
        bus.revoke_locks().expect("revoke");

        let err = bus.complete(&batch[0]).await.expect_err("lock lost");
        assert!(err.is_lock_lost());

        // The message is back in the ready queue for redelivery.
        assert_eq!(bus.ready_len().expect("ready"), 1);
    }

    #[tokio::test]
    async fn dead_letter_records_reason() {
        let bus = MemoryBus::new("orders");
        bus.publish("payload", HashMap::new()).expect("publish");

        let batch = bus
            .receive_messages(1, Duration::from_millis(10), &CancellationToken::new())
            .await
            .expect("receive");
        bus.dead_letter(&batch[0], "handler failed")
            .await
            .expect("dead letter");

        let dead = bus.dead_letters().expect("dead letters");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "handler failed");
        assert_eq!(bus.ready_len().expect("ready"), 0);
    }

    #[tokio::test]
    async fn empty_receive_returns_after_wait() {
        let bus = MemoryBus::new("orders");
        let batch = bus
            .receive_messages(5, Duration::from_millis(5), &CancellationToken::new())
            .await
            .expect("receive");
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_long_poll() {
        let bus = MemoryBus::new("orders");
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let started = tokio::time::Instant::now();
        let batch = bus
            .receive_messages(5, Duration::from_secs(30), &cancel)
            .await
            .expect("receive");
        assert!(batch.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));

        // An already-fired token short-circuits before any waiting.
        let batch = bus
            .receive_messages(5, Duration::from_secs(30), &cancel)
            .await
            .expect("receive");
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn subscription_name_flows_into_messages() {
        let bus = MemoryBus::with_subscription("events", "audit");
        bus.publish("payload", HashMap::new()).expect("publish");

        let batch = bus
            .receive_messages(1, Duration::from_millis(10), &CancellationToken::new())
            .await
            .expect("receive");
        assert_eq!(batch[0].subscription_name.as_deref(), Some("audit"));
        assert_eq!(bus.subscription_name(), Some("audit"));
    }
}
