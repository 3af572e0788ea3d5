//! The ingestion pull loop: poll bus, persist task, settle message.
//!
//! Implements the transactional-outbox persist-before-ack pattern: a
//! received message becomes a durable ledger task **before** any settlement
//! call reaches the broker, so a crash anywhere in between causes
//! redelivery and a harmless idempotent re-upsert, never message loss.
//!
//! Messages in a batch are processed concurrently with bounded fan-out;
//! each message runs under a hard 5-minute cap composed with the loop's
//! shutdown signal.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::bus::{BusMessage, MessageBus};
use crate::config::IngestConfig;
use crate::error::Result;
use crate::handler::TaskHandler;
use crate::metrics::{labels, names};
use crate::repository::Ledger;
use crate::retry::{retry_after, retry_async, DEFAULT_MAX_ATTEMPTS};
use crate::task::{Task, TaskStatus};

/// Wall-clock cap for processing a single message.
const MESSAGE_PROCESSING_DEADLINE: Duration = Duration::from_secs(300);

/// Metadata key naming the queue or topic a task came from.
pub const METADATA_SOURCE: &str = "Source";
/// Metadata key naming the topic, for subscription sources.
pub const METADATA_TOPIC_NAME: &str = "TopicName";
/// Metadata key naming the subscription, for subscription sources.
pub const METADATA_SUBSCRIPTION_NAME: &str = "SubscriptionName";

/// Observable outcome of one ingest tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Messages received this tick.
    pub received: usize,
    /// Messages fully processed and settled as successes.
    pub succeeded: usize,
    /// Messages that failed processing.
    pub failed: usize,
    /// Tick wall-clock time.
    pub elapsed: Duration,
}

impl TickReport {
    /// Success rate as a percentage; an empty tick counts as 100%.
    #[must_use]
    pub fn success_rate_percent(&self) -> f64 {
        if self.received == 0 {
            return 100.0;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            self.succeeded as f64 / self.received as f64 * 100.0
        }
    }

    /// Average processing time per message in milliseconds.
    #[must_use]
    pub fn average_millis_per_message(&self) -> f64 {
        if self.received == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            self.elapsed.as_secs_f64() * 1000.0 / self.received as f64
        }
    }
}

/// A long-running pull loop for one queue or subscription.
pub struct Ingester<L, B, H> {
    ledger: Arc<L>,
    bus: Arc<B>,
    handler: Arc<H>,
    config: IngestConfig,
}

impl<L, B, H> Ingester<L, B, H>
where
    L: Ledger,
    B: MessageBus,
    H: TaskHandler,
{
    /// Creates an ingester over the given ledger, bus, and handler.
    #[must_use]
    pub fn new(ledger: Arc<L>, bus: Arc<B>, handler: Arc<H>, config: IngestConfig) -> Self {
        Self {
            ledger,
            bus,
            handler,
            config,
        }
    }

    /// Runs ticks until `shutdown` fires.
    ///
    /// Receive failures were already retried inside the tick; a tick that
    /// still fails is logged and the loop backs off one polling wait before
    /// trying again.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok` on shutdown; the `Result` keeps the
    /// signature stable for hosts that treat loop exit as fallible.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(source = self.bus.source_name(), "ingester started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.tick(&shutdown).await {
                Ok(report) if report.received == 0 => {}
                Ok(report) => {
                    info!(
                        source = self.bus.source_name(),
                        received = report.received,
                        succeeded = report.succeeded,
                        failed = report.failed,
                        elapsed_ms = report.elapsed.as_millis() as u64,
                        success_rate = report.success_rate_percent(),
                        "ingest tick finished"
                    );
                }
                Err(err) => {
                    error!(source = self.bus.source_name(), error = %err, "ingest tick failed");
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(self.config.polling_wait) => {}
                    }
                }
            }
        }
        info!(source = self.bus.source_name(), "ingester stopped");
        Ok(())
    }

    /// Receives one batch and processes it to completion.
    ///
    /// The receive call carries the shutdown token into the bus and is also
    /// raced against it here, so neither a long poll nor a retry backoff
    /// outlives a shutdown request.
    ///
    /// # Errors
    ///
    /// Returns the receive error after the retry budget is exhausted.
    #[instrument(skip_all, fields(source = self.bus.source_name()))]
    pub async fn tick(&self, shutdown: &CancellationToken) -> Result<TickReport> {
        let started = Instant::now();

        let messages = tokio::select! {
            () = shutdown.cancelled() => Vec::new(),
            received = retry_async(DEFAULT_MAX_ATTEMPTS, || {
                self.bus.receive_messages(
                    self.config.batch_size,
                    self.config.polling_wait,
                    shutdown,
                )
            }) => received?,
        };

        let received = messages.len();
        let succeeded = AtomicUsize::new(0);

        stream::iter(messages)
            .for_each_concurrent(self.config.batch_size.max(1), |message| {
                let succeeded = &succeeded;
                async move {
                    let ok = tokio::select! {
                        () = shutdown.cancelled() => {
                            debug!(
                                message_id = %message.message_id,
                                "shutdown mid-message; leaving the lock to expire"
                            );
                            false
                        }
                        outcome = tokio::time::timeout(
                            MESSAGE_PROCESSING_DEADLINE,
                            self.process_message(&message),
                        ) => match outcome {
                            Ok(ok) => ok,
                            Err(_) => {
                                warn!(message_id = %message.message_id, "message processing cap exceeded");
                                self.settle_failure(&message, "processing cap exceeded").await;
                                false
                            }
                        }
                    };

                    if ok {
                        succeeded.fetch_add(1, Ordering::SeqCst);
                    }
                    counter!(
                        names::INGEST_MESSAGES_TOTAL,
                        labels::SOURCE => self.bus.source_name().to_string(),
                        labels::RESULT => if ok { "success" } else { "failure" },
                    )
                    .increment(1);
                }
            })
            .await;

        let succeeded = succeeded.into_inner();
        let report = TickReport {
            received,
            succeeded,
            failed: received - succeeded,
            elapsed: started.elapsed(),
        };

        histogram!(
            names::INGEST_TICK_SECONDS,
            labels::SOURCE => self.bus.source_name().to_string(),
        )
        .record(report.elapsed.as_secs_f64());

        Ok(report)
    }

    /// Builds the ledger task for a received message.
    fn build_task(&self, message: &BusMessage) -> Task {
        let mut task = Task::new(&message.message_id, &message.body)
            .with_status(TaskStatus::Processing);
        task.processed_at = Some(Utc::now());
        task.metadata = message.properties.clone();
        task.metadata
            .insert(METADATA_SOURCE.to_string(), self.bus.source_name().to_string());
        if let Some(subscription) = &message.subscription_name {
            task.metadata
                .insert(METADATA_TOPIC_NAME.to_string(), self.bus.source_name().to_string());
            task.metadata
                .insert(METADATA_SUBSCRIPTION_NAME.to_string(), subscription.clone());
        }
        task
    }

    /// Persists, dispatches, and settles one message. Returns true on a
    /// fully successful pass.
    async fn process_message(&self, message: &BusMessage) -> bool {
        let task = self.build_task(message);

        // Persist before anything can acknowledge the message upstream.
        match self.ledger.upsert_task(&task).await {
            Ok(_) => {}
            Err(err) if err.is_duplicate_key() => {
                debug!(task_id = %task.task_id, "redelivered message already persisted");
            }
            Err(err) => {
                error!(
                    task_id = %task.task_id,
                    error = %err,
                    "persist failed; leaving the message locked for redelivery"
                );
                return false;
            }
        }

        let handler_result = if self.config.store_and_forward {
            Ok(())
        } else {
            self.invoke_handler(&task).await
        };

        match handler_result {
            Ok(()) => {
                if !self.mark_task(&task.task_id, TaskStatus::Completed).await {
                    warn!(task_id = %task.task_id, "could not mark task Completed");
                }
                self.settle_success(message).await;
                true
            }
            Err(err) => {
                if !self.mark_task(&task.task_id, TaskStatus::Failed).await {
                    warn!(task_id = %task.task_id, "could not mark task Failed");
                }
                self.settle_failure(message, &err.to_string()).await;
                false
            }
        }
    }

    /// Invokes the user handler under the per-message retry envelope.
    ///
    /// Restarts from the handler invocation only; the message is not
    /// re-received. Terminal handler errors break out early.
    async fn invoke_handler(&self, task: &Task) -> crate::handler::HandlerResult {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.handler.handle(task).await {
                Ok(()) => return Ok(()),
                Err(err) if err.retryable && attempt < DEFAULT_MAX_ATTEMPTS => {
                    let wait = retry_after(attempt);
                    warn!(
                        task_id = %task.task_id,
                        attempt,
                        wait_secs = wait.as_secs(),
                        error = %err,
                        "handler failed; retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn mark_task(&self, task_id: &str, status: TaskStatus) -> bool {
        match self.ledger.try_update_task_status(task_id, status).await {
            Ok(updated) => updated,
            Err(err) => {
                error!(task_id, error = %err, "status update failed");
                false
            }
        }
    }

    async fn settle_success(&self, message: &BusMessage) {
        if let Err(err) = self.bus.complete(message).await {
            if err.is_lock_lost() {
                warn!(
                    message_id = %message.message_id,
                    "lock lost on complete; the message will be redelivered"
                );
            } else {
                error!(message_id = %message.message_id, error = %err, "complete failed");
            }
        }
    }

    async fn settle_failure(&self, message: &BusMessage, reason: &str) {
        let result = if self.config.dead_letter_failed_messages {
            self.bus.dead_letter(message, reason).await
        } else {
            self.bus.abandon(message).await
        };

        if let Err(err) = result {
            if err.is_lock_lost() {
                warn!(
                    message_id = %message.message_id,
                    "lock lost on settlement; the message will be redelivered"
                );
            } else {
                error!(message_id = %message.message_id, error = %err, "failure settlement failed");
            }
        }
    }
}
