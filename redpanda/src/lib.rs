//! Redpanda broker adapters for ledger event delivery.
//!
//! Implements the broker seam from `ledger-events-core` with rdkafka, so the
//! same code runs against Redpanda, Apache Kafka or any Kafka-compatible broker:
//!
//! - [`RedpandaSink`]: `MessageSink` over a `FutureProducer`, plus topic
//!   provisioning through the admin API
//! - [`RedpandaSource`]: `MessageSource` over a group `StreamConsumer` with
//!   manual commits
//!
//! # Delivery Semantics
//!
//! **At-least-once** in both directions:
//! - the producer waits for `acks=all` before a send counts as delivered
//! - the consumer commits only after the message has been handled, so a crash
//!   before the commit redelivers it
//! - ordering holds within a partition; messages are keyed by aggregate id
//!
//! # Example
//!
//! ```no_run
//! use ledger_events_redpanda::{RedpandaSink, RedpandaSource};
//! use ledger_events_runtime::{EventConsumer, EventPublisher};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let sink = RedpandaSink::new("localhost:9092")?;
//! let publisher = EventPublisher::new(Arc::new(sink), "account-events");
//! publisher.provision_topics().await;
//!
//! let source = RedpandaSource::builder()
//!     .brokers("localhost:9092")
//!     .group_id("account-events-worker")
//!     .topic("account-events")
//!     .build()?;
//! let consumer = EventConsumer::new(Arc::new(source));
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod sink;
mod source;

pub use error::{RedpandaError, classify_kafka_error};
pub use sink::{
    DEFAULT_REPLICATION_FACTOR, DEFAULT_TOPIC_PARTITIONS, RedpandaSink, RedpandaSinkBuilder,
};
pub use source::{RedpandaSource, RedpandaSourceBuilder};
