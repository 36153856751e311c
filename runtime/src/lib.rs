//! # Ledger Events Runtime
//!
//! The moving parts of reliable event delivery, written against the traits in
//! `ledger-events-core` so they run unchanged over Postgres and Redpanda in
//! production and over the in-memory doubles in tests.
//!
//! ## Core Components
//!
//! - **[`EventPublisher`]**: primary and dead-letter publishing with a per-call timeout
//! - **[`OutboxProcessor`]**: periodic sweep draining the outbox with bounded retries
//! - **[`EventConsumer`]**: commit-after-process dispatch to per-type handlers
//! - **[`EventRecorder`]**: outbox-first write path for business operations
//!
//! ## Example
//!
//! ```
//! use chrono::Utc;
//! use ledger_events_core::account::{AccountDeposited, account_registry};
//! use ledger_events_runtime::{
//!     EventPublisher, EventRecorder, OutboxProcessor, OutboxProcessorConfig,
//! };
//! use ledger_events_testing::{InMemoryBroker, InMemoryOutboxStore};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let broker = InMemoryBroker::new();
//! let store = Arc::new(InMemoryOutboxStore::new());
//! let publisher = Arc::new(EventPublisher::new(Arc::new(broker.clone()), "account-events"));
//!
//! // Broker down: the direct publish fails, the outbox keeps the event.
//! broker.fail_next_send(
//!     "account-events",
//!     ledger_events_core::BrokerError::Unavailable("all brokers down".into()),
//! );
//! let recorder = EventRecorder::new(store.clone(), Arc::clone(&publisher));
//! let outcome = recorder
//!     .record(&AccountDeposited::new("acct-1", 50.0, 150.0, Utc::now()))
//!     .await;
//! assert!(!outcome.published);
//!
//! // The processor delivers it once the broker is back.
//! let processor = OutboxProcessor::new(
//!     store,
//!     publisher,
//!     account_registry().unwrap(),
//!     OutboxProcessorConfig::default(),
//! );
//! let report = processor.process_next_batch().await.unwrap();
//! assert_eq!(report.published, 1);
//! assert_eq!(broker.messages("account-events").len(), 1);
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Commit-after-process dispatch to per-type handlers
pub mod consumer;
/// Prometheus exporter and metric descriptions
pub mod metrics;
/// Periodic outbox sweep with bounded retries
pub mod processor;
/// Primary and dead-letter publishing
pub mod publisher;
/// Outbox-first write path for business operations
pub mod recorder;
/// Exponential backoff for broker reads
pub mod retry;

pub use consumer::{ConsumerError, EventConsumer};
pub use processor::{BatchReport, OutboxProcessor, OutboxProcessorConfig, RepeatedErrorLog};
pub use publisher::{DLQ_SUFFIX, EventPublisher, PublishError};
pub use recorder::{EventRecorder, RecordOutcome};
pub use retry::RetryPolicy;
