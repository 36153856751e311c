//! Integration tests for the Redpanda adapters against a real Kafka broker.
//!
//! These tests are marked as `#[ignore]` by default because they:
//! - Require Docker to be running (for testcontainers)
//! - Take 15-60 seconds per test to spin up Kafka
//!
//! To run explicitly:
//! ```bash
//! cargo test -p ledger-events-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used, clippy::unwrap_used)]
#![allow(clippy::panic)]

use chrono::Utc;
use ledger_events_core::account::{AccountCreated, AccountDeposited};
use ledger_events_core::broker::{BrokerMessage, HEADER_EVENT_TYPE, MessageSink, MessageSource};
use ledger_events_redpanda::{RedpandaSink, RedpandaSource};
use ledger_events_runtime::{EventConsumer, EventPublisher};
use ledger_events_testing::RecordingHandler;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};
use tokio_util::sync::CancellationToken;

async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    ledger_events_testing::helpers::init_test_tracing();

    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "false")
        .start()
        .await
        .expect("Failed to start Kafka container");
    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");

    (kafka, format!("{host}:{port}"))
}

/// Create `topic` (and its DLQ), retrying until the broker accepts admin requests.
async fn provision(sink: &RedpandaSink, topic: &str) {
    let topics = vec![topic.to_string(), format!("{topic}-dlq")];
    for attempt in 1..=60 {
        if sink.ensure_topics(&topics).await.is_ok() {
            tokio::time::sleep(Duration::from_secs(2)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(attempt != 60, "Kafka failed to accept topic creation");
    }
}

fn source(brokers: &str, topic: &str, group: &str) -> RedpandaSource {
    RedpandaSource::builder()
        .brokers(brokers)
        .group_id(group)
        .topic(topic)
        .auto_offset_reset("earliest")
        .build()
        .expect("Failed to create source")
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn published_events_reach_the_consumer_handler() {
    let (_kafka, brokers) = start_kafka().await;
    let sink = RedpandaSink::new(&brokers).expect("Failed to create sink");
    provision(&sink, "account-events").await;

    let publisher = EventPublisher::new(Arc::new(sink), "account-events")
        .with_timeout(Duration::from_secs(10));
    publisher
        .publish_event(&AccountCreated::new("acct-1", "Ada", "ada@example.com", Utc::now()))
        .await
        .expect("publish created");
    publisher
        .publish_event(&AccountDeposited::new("acct-1", 50.0, 50.0, Utc::now()))
        .await
        .expect("publish deposited");

    let created = RecordingHandler::new("AccountCreated");
    let deposited = RecordingHandler::new("AccountDeposited");
    let mut consumer = EventConsumer::new(Arc::new(source(
        &brokers,
        "account-events",
        "account-events-worker",
    )));
    consumer.register_handler(Arc::new(created.clone())).unwrap();
    consumer.register_handler(Arc::new(deposited.clone())).unwrap();

    let cancel = CancellationToken::new();
    let consumer = Arc::new(consumer);
    let task = tokio::spawn({
        let consumer = Arc::clone(&consumer);
        let cancel = cancel.clone();
        async move { consumer.start(cancel).await }
    });

    let received = tokio::time::timeout(Duration::from_secs(30), async {
        while created.successes() < 1 || deposited.successes() < 1 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    cancel.cancel();
    task.await.expect("consumer task").expect("consumer stops cleanly");

    assert!(received.is_ok(), "handlers did not receive both events");
    let delivery = &created.deliveries()[0];
    assert_eq!(delivery.key.as_deref(), Some("acct-1"));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn uncommitted_message_is_redelivered_to_the_group() {
    let (_kafka, brokers) = start_kafka().await;
    let sink = RedpandaSink::new(&brokers).expect("Failed to create sink");
    provision(&sink, "redelivery-events").await;

    sink.send(BrokerMessage {
        topic: "redelivery-events".into(),
        key: "acct-1".into(),
        payload: br#"{"event_type":"AccountCreated"}"#.to_vec(),
        headers: vec![(HEADER_EVENT_TYPE.into(), "AccountCreated".into())],
        timestamp: Utc::now(),
    })
    .await
    .expect("send");

    let first = source(&brokers, "redelivery-events", "redelivery-group");
    let message = tokio::time::timeout(Duration::from_secs(30), first.fetch())
        .await
        .expect("fetch timed out")
        .expect("fetch");
    assert_eq!(message.header(HEADER_EVENT_TYPE), Some("AccountCreated"));
    first.redeliver(&message).await.expect("seek");
    let again = tokio::time::timeout(Duration::from_secs(30), first.fetch())
        .await
        .expect("refetch timed out")
        .expect("refetch");
    assert_eq!(again.offset, message.offset);

    // Never committed: a new member of the group starts from the same offset.
    first.close().expect("close");
    drop(first);
    let second = source(&brokers, "redelivery-events", "redelivery-group");
    let replayed = tokio::time::timeout(Duration::from_secs(60), second.fetch())
        .await
        .expect("replay timed out")
        .expect("replay");
    assert_eq!(replayed.offset, message.offset);

    second.commit(&replayed).await.expect("commit");
    second.close().expect("close");
}
