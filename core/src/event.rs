//! Domain event trait and the canonical event envelope.
//!
//! Every event that leaves a business operation travels through this system as an
//! [`EventEnvelope`]: the event type discriminator, the id of the aggregate that
//! produced it, the serialized payload, and the time the event occurred. The
//! envelope is what the outbox stores, what the publisher writes to the broker,
//! and what consumers receive.
//!
//! # Serialization
//!
//! Payloads are JSON. The format is self-describing, which lets a consumer recover
//! the event type from the payload itself when a broker message arrives without
//! its `event_type` header.
//!
//! # Example
//!
//! ```
//! use chrono::{DateTime, Utc};
//! use ledger_events_core::event::{DomainEvent, EventEnvelope};
//! use serde::{Deserialize, Serialize};
//! use uuid::Uuid;
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct InvoiceIssued {
//!     id: Uuid,
//!     invoice_id: String,
//!     issued_at: DateTime<Utc>,
//! }
//!
//! impl DomainEvent for InvoiceIssued {
//!     const EVENT_TYPE: &'static str = "InvoiceIssued";
//!
//!     fn event_id(&self) -> Uuid {
//!         self.id
//!     }
//!
//!     fn aggregate_id(&self) -> &str {
//!         &self.invoice_id
//!     }
//!
//!     fn occurred_at(&self) -> DateTime<Utc> {
//!         self.issued_at
//!     }
//! }
//!
//! let event = InvoiceIssued {
//!     id: Uuid::new_v4(),
//!     invoice_id: "inv-1".to_string(),
//!     issued_at: Utc::now(),
//! };
//! let envelope = EventEnvelope::from_event(&event).unwrap();
//! assert_eq!(envelope.event_type, "InvoiceIssued");
//! assert_eq!(envelope.aggregate_id, "inv-1");
//! ```

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Error types for event operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),
}

/// A domain event that can be recorded in the outbox and published to the broker.
///
/// Implementors are plain serde types. The event type discriminator is an
/// associated constant so that registries and typed handlers can name the type
/// without holding an instance, which makes a misspelled discriminator a compile
/// error rather than a silently dropped message.
///
/// # Thread Safety
///
/// Events must be `Send + Sync + 'static` so they can cross task boundaries.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable event type discriminator (e.g. `"AccountCreated"`).
    const EVENT_TYPE: &'static str;

    /// Globally unique id of this event occurrence.
    fn event_id(&self) -> Uuid;

    /// Id of the entity that owns this event. Used as the broker partition key.
    fn aggregate_id(&self) -> &str;

    /// When the event happened in the domain (not when it was published).
    fn occurred_at(&self) -> DateTime<Utc>;

    /// Returns the event type discriminator.
    fn event_type(&self) -> &'static str {
        Self::EVENT_TYPE
    }

    /// Serialize this event to its JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if the event cannot be serialized.
    fn to_payload(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Deserialize an event from its JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] if the bytes do not decode into `Self`.
    fn from_payload(bytes: &[u8]) -> Result<Self, EventError>
    where
        Self: Sized,
    {
        serde_json::from_slice(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

/// Canonical wire and storage representation of a domain event.
///
/// The payload is opaque to everything except the typed decoders in the
/// [`EventTypeRegistry`](crate::registry::EventTypeRegistry) and the consumer
/// handlers; it is never rewritten after the envelope is created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventEnvelope {
    /// Unique id, assigned when the domain event was created.
    pub id: Uuid,

    /// Event type discriminator used for dead-letter headers and consumer dispatch.
    pub event_type: String,

    /// Owning aggregate; becomes the partition key so per-aggregate order holds.
    pub aggregate_id: String,

    /// Serialized domain event.
    pub payload: Vec<u8>,

    /// Domain occurrence time.
    pub occurred_at: DateTime<Utc>,
}

impl EventEnvelope {
    /// Create an envelope from already-serialized parts.
    #[must_use]
    pub const fn new(
        id: Uuid,
        event_type: String,
        aggregate_id: String,
        payload: Vec<u8>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            event_type,
            aggregate_id,
            payload,
            occurred_at,
        }
    }

    /// Create an envelope from a typed domain event.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if the event cannot be serialized.
    pub fn from_event<E: DomainEvent>(event: &E) -> Result<Self, EventError> {
        Ok(Self {
            id: event.event_id(),
            event_type: event.event_type().to_string(),
            aggregate_id: event.aggregate_id().to_string(),
            payload: event.to_payload()?,
            occurred_at: event.occurred_at(),
        })
    }

    /// Decode the payload into a typed event.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] if the payload is not an `E`.
    pub fn decode<E: DomainEvent>(&self) -> Result<E, EventError> {
        E::from_payload(&self.payload)
    }
}

impl fmt::Display for EventEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EventEnvelope {{ id: {}, type: {}, aggregate: {}, size: {} bytes }}",
            self.id,
            self.event_type,
            self.aggregate_id,
            self.payload.len()
        )
    }
}
