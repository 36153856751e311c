//! # Ledger Events Core
//!
//! Core types and traits for reliable delivery of ledger domain events.
//!
//! Events produced by business operations are written to a durable outbox,
//! relayed to the message broker by the outbox processor, and dispatched to
//! typed handlers by the consumer. This crate holds everything those pieces
//! agree on; it performs no I/O of its own.
//!
//! ## Core Concepts
//!
//! - **Envelope**: [`EventEnvelope`], the canonical form of an event in transit
//! - **Registry**: [`EventTypeRegistry`], event type discriminator to typed decoder
//! - **Outbox**: [`OutboxStore`], durable queue of events awaiting publication
//! - **Broker seam**: [`MessageSink`] / [`MessageSource`], the broker client boundary
//! - **Handlers**: [`EventHandler`], consumer-side processing of one event type
//!
//! ## Delivery Guarantees
//!
//! - At-least-once from outbox to broker; duplicates are possible
//! - Per-aggregate order on the broker (the aggregate id is the partition key)
//! - Events that exhaust their retries end up on a dead-letter topic
//!
//! ## Example
//!
//! ```
//! use chrono::Utc;
//! use ledger_events_core::account::{AccountDeposited, account_registry};
//! use ledger_events_core::outbox::NewOutboxRecord;
//!
//! let event = AccountDeposited::new("acct-1", 250.0, 1250.0, Utc::now());
//! let record = NewOutboxRecord::from_event(&event).unwrap();
//!
//! let registry = account_registry().unwrap();
//! let envelope = registry.decode(&record.event_type, &record.payload).unwrap();
//! assert_eq!(envelope.aggregate_id, "acct-1");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod account;
pub mod broker;
pub mod clock;
pub mod event;
pub mod handler;
pub mod outbox;
pub mod registry;

// Re-export commonly used types
pub use broker::{BrokerError, BrokerMessage, InboundMessage, MessageSink, MessageSource};
pub use chrono::{DateTime, Utc};
pub use clock::{Clock, SystemClock};
pub use event::{DomainEvent, EventEnvelope, EventError};
pub use handler::{EventHandler, HandlerContext, HandlerError, TypedHandler};
pub use outbox::{NewOutboxRecord, OutboxError, OutboxRecord, OutboxStatus, OutboxStore};
pub use registry::{EventTypeRegistry, RegistryError};
pub use uuid::Uuid;
