//! Ingester tests over the in-memory bus and ledger.
//!
//! The load-bearing property is persist-before-ack: every message the bus
//! saw completed has a durable ledger task, and redelivery after a missed
//! acknowledgment is a harmless idempotent upsert.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_ledger::config::IngestConfig;
use keel_ledger::handler::{FailingHandler, HandlerError, HandlerResult, NoOpHandler, TaskHandler};
use keel_ledger::ingest::{Ingester, METADATA_SOURCE, METADATA_SUBSCRIPTION_NAME};
use keel_ledger::prelude::*;
use tokio_util::sync::CancellationToken;

struct CountingHandler {
    count: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskHandler for CountingHandler {
    async fn handle(&self, _task: &Task) -> HandlerResult {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn fast_config() -> IngestConfig {
    IngestConfig::default().with_polling_wait(Duration::from_millis(20))
}

#[tokio::test]
async fn completed_messages_have_durable_tasks() {
    let ledger = Arc::new(MemoryLedger::new());
    let bus = Arc::new(MemoryBus::new("orders"));
    let mut ids = Vec::new();
    for n in 0..3 {
        let mut properties = HashMap::new();
        properties.insert("kind".to_string(), format!("order-{n}"));
        ids.push(bus.publish(format!("payload-{n}"), properties).expect("publish"));
    }

    let ingester = Ingester::new(
        Arc::clone(&ledger),
        Arc::clone(&bus),
        Arc::new(NoOpHandler),
        fast_config(),
    );
    let report = ingester
        .tick(&CancellationToken::new())
        .await
        .expect("tick");

    assert_eq!(report.received, 3);
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.failed, 0);
    assert!((report.success_rate_percent() - 100.0).abs() < f64::EPSILON);

    // Every completed message has a matching ledger task.
    assert_eq!(bus.ready_len().expect("ready"), 0);
    assert_eq!(bus.in_flight_len().expect("in flight"), 0);
    for id in ids {
        let task = ledger
            .get_by_task_id(&id)
            .await
            .expect("get")
            .expect("task persisted");
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.processed_at.is_some());
        assert!(task.completed_at.is_some());
        assert_eq!(task.metadata.get(METADATA_SOURCE).map(String::as_str), Some("orders"));
        assert!(task.metadata.contains_key("kind"));
    }
}

#[tokio::test]
async fn handler_failure_dead_letters_with_reason() {
    let ledger = Arc::new(MemoryLedger::new());
    let bus = Arc::new(MemoryBus::new("orders"));
    let id = bus.publish("payload", HashMap::new()).expect("publish");

    let ingester = Ingester::new(
        Arc::clone(&ledger),
        Arc::clone(&bus),
        Arc::new(FailingHandler::new(HandlerError::terminal("bad payload"))),
        fast_config(),
    );
    let report = ingester
        .tick(&CancellationToken::new())
        .await
        .expect("tick");
    assert_eq!(report.failed, 1);

    let task = ledger.get_by_task_id(&id).await.expect("get").expect("task");
    assert_eq!(task.status, TaskStatus::Failed);

    let dead = bus.dead_letters().expect("dead letters");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message_id, id);
    assert!(dead[0].reason.contains("bad payload"));
}

#[tokio::test]
async fn abandon_disposition_redelivers_instead() {
    let ledger = Arc::new(MemoryLedger::new());
    let bus = Arc::new(MemoryBus::new("orders"));
    bus.publish("payload", HashMap::new()).expect("publish");

    let ingester = Ingester::new(
        Arc::clone(&ledger),
        Arc::clone(&bus),
        Arc::new(FailingHandler::new(HandlerError::terminal("bad payload"))),
        fast_config().with_dead_letter_failed_messages(false),
    );
    ingester
        .tick(&CancellationToken::new())
        .await
        .expect("tick");

    assert!(bus.dead_letters().expect("dead letters").is_empty());
    assert_eq!(bus.ready_len().expect("ready"), 1);

    let redelivered = bus
        .receive_messages(1, Duration::from_millis(10), &CancellationToken::new())
        .await
        .expect("receive");
    assert_eq!(redelivered[0].delivery_count, 2);
}

#[tokio::test]
async fn store_and_forward_skips_the_handler() {
    let ledger = Arc::new(MemoryLedger::new());
    let bus = Arc::new(MemoryBus::new("orders"));
    let id = bus.publish("payload", HashMap::new()).expect("publish");

    let count = Arc::new(AtomicUsize::new(0));
    let ingester = Ingester::new(
        Arc::clone(&ledger),
        Arc::clone(&bus),
        Arc::new(CountingHandler {
            count: Arc::clone(&count),
        }),
        fast_config().with_store_and_forward(true),
    );
    let report = ingester
        .tick(&CancellationToken::new())
        .await
        .expect("tick");
    assert_eq!(report.succeeded, 1);
    assert_eq!(count.load(Ordering::SeqCst), 0, "handler must not run");

    // The task sits in Completed, ready for worker-lane promotion.
    let task = ledger.get_by_task_id(&id).await.expect("get").expect("task");
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn redelivery_is_an_idempotent_upsert() {
    let ledger = Arc::new(MemoryLedger::new());
    let bus = Arc::new(MemoryBus::new("orders"));
    bus.publish_with_id("m-1", "payload", HashMap::new())
        .expect("publish");

    let ingester = Ingester::new(
        Arc::clone(&ledger),
        Arc::clone(&bus),
        Arc::new(NoOpHandler),
        fast_config(),
    );
    ingester
        .tick(&CancellationToken::new())
        .await
        .expect("tick");

    // The broker redelivers the same logical message (e.g. a crash happened
    // after persist, before acknowledge).
    bus.publish_with_id("m-1", "payload", HashMap::new())
        .expect("republish");
    let report = ingester
        .tick(&CancellationToken::new())
        .await
        .expect("tick");
    assert_eq!(report.succeeded, 1);

    assert_eq!(ledger.len().expect("len"), 1);
    let task = ledger.get_by_task_id("m-1").await.expect("get").expect("task");
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn subscription_sources_tag_topic_metadata() {
    let ledger = Arc::new(MemoryLedger::new());
    let bus = Arc::new(MemoryBus::with_subscription("events", "audit"));
    let id = bus.publish("payload", HashMap::new()).expect("publish");

    let ingester = Ingester::new(
        Arc::clone(&ledger),
        Arc::clone(&bus),
        Arc::new(NoOpHandler),
        fast_config(),
    );
    ingester
        .tick(&CancellationToken::new())
        .await
        .expect("tick");

    let task = ledger.get_by_task_id(&id).await.expect("get").expect("task");
    assert_eq!(
        task.metadata.get(METADATA_SUBSCRIPTION_NAME).map(String::as_str),
        Some("audit")
    );
}

#[tokio::test]
async fn shutdown_interrupts_an_idle_receive() {
    let ledger = Arc::new(MemoryLedger::new());
    let bus = Arc::new(MemoryBus::new("orders"));
    // Default config long-polls 30s per receive; shutdown must not wait
    // that out.
    let ingester = Ingester::new(
        ledger,
        bus,
        Arc::new(NoOpHandler),
        IngestConfig::default(),
    );

    let shutdown = CancellationToken::new();
    let canceller = shutdown.clone();
    let handle = tokio::spawn(async move { ingester.run(shutdown).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    canceller.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("run should exit long before the poll elapses")
        .expect("join");
    assert!(result.is_ok());
}

#[tokio::test]
async fn empty_tick_reports_nothing() {
    let ledger = Arc::new(MemoryLedger::new());
    let bus = Arc::new(MemoryBus::new("orders"));
    let ingester = Ingester::new(
        Arc::clone(&ledger),
        Arc::clone(&bus),
        Arc::new(NoOpHandler),
        fast_config(),
    );

    let report = ingester
        .tick(&CancellationToken::new())
        .await
        .expect("tick");
    assert_eq!(report.received, 0);
    assert!(ledger.is_empty().expect("empty"));
}
