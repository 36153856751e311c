//! Event type registry: maps a discriminator string to a typed decoder.
//!
//! Outbox records and broker messages identify their payload only by an event
//! type string. The registry turns that string back into a strongly typed decode
//! step, so an unknown or misspelled type is detected explicitly instead of
//! falling through a `match` on strings.
//!
//! # Example
//!
//! ```
//! use ledger_events_core::account::{AccountCreated, account_registry};
//! use ledger_events_core::event::DomainEvent;
//! use chrono::Utc;
//!
//! let registry = account_registry().unwrap();
//! let event = AccountCreated::new("acct-1", "Ada", "ada@example.com", Utc::now());
//! let payload = event.to_payload().unwrap();
//!
//! let envelope = registry.decode("AccountCreated", &payload).unwrap();
//! assert_eq!(envelope.aggregate_id, "acct-1");
//! assert_eq!(envelope.id, event.meta.id);
//! ```

use crate::event::{DomainEvent, EventEnvelope, EventError};
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised by the registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No decoder is registered for the event type.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// A decoder for this event type is already registered.
    #[error("Event type already registered: {0}")]
    DuplicateEventType(String),

    /// The event type discriminator is empty or contains whitespace.
    #[error("Invalid event type name: {0:?}")]
    InvalidEventType(String),

    /// The payload did not decode into the registered type.
    #[error("Failed to decode {event_type} payload: {source}")]
    Decode {
        /// Event type that was being decoded.
        event_type: String,
        /// Underlying decode failure.
        source: EventError,
    },

    /// The payload names a different event type than its discriminator.
    #[error("Payload declares event type {embedded} but was stored as {declared}")]
    TypeMismatch {
        /// Discriminator the record or message was stored under.
        declared: String,
        /// Type named inside the payload.
        embedded: String,
    },
}

type Decoder = fn(&[u8]) -> Result<EventEnvelope, RegistryError>;

#[derive(Deserialize)]
struct EmbeddedType {
    event_type: Option<String>,
}

/// Read the `event_type` field embedded in a JSON payload, if any.
#[must_use]
pub fn embedded_event_type(payload: &[u8]) -> Option<String> {
    serde_json::from_slice::<EmbeddedType>(payload)
        .ok()
        .and_then(|probe| probe.event_type)
}

fn decode_as<E: DomainEvent>(payload: &[u8]) -> Result<EventEnvelope, RegistryError> {
    if let Some(embedded) = embedded_event_type(payload) {
        if embedded != E::EVENT_TYPE {
            return Err(RegistryError::TypeMismatch {
                declared: E::EVENT_TYPE.to_string(),
                embedded,
            });
        }
    }

    let event = E::from_payload(payload).map_err(|source| RegistryError::Decode {
        event_type: E::EVENT_TYPE.to_string(),
        source,
    })?;

    // Keep the stored bytes verbatim; re-serializing could reorder fields.
    Ok(EventEnvelope::new(
        event.event_id(),
        E::EVENT_TYPE.to_string(),
        event.aggregate_id().to_string(),
        payload.to_vec(),
        event.occurred_at(),
    ))
}

/// Validates an event type discriminator.
///
/// # Errors
///
/// Returns [`RegistryError::InvalidEventType`] for empty names or names with whitespace.
pub fn validate_event_type(name: &str) -> Result<(), RegistryError> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(RegistryError::InvalidEventType(name.to_string()));
    }
    Ok(())
}

/// Mapping from event type discriminator to a typed decoder.
#[derive(Clone, Default)]
pub struct EventTypeRegistry {
    decoders: HashMap<&'static str, Decoder>,
}

impl EventTypeRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the decoder for `E` under `E::EVENT_TYPE`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidEventType`] if the discriminator is malformed and
    /// [`RegistryError::DuplicateEventType`] if it is already registered.
    pub fn register<E: DomainEvent>(&mut self) -> Result<&mut Self, RegistryError> {
        validate_event_type(E::EVENT_TYPE)?;
        if self.decoders.contains_key(E::EVENT_TYPE) {
            return Err(RegistryError::DuplicateEventType(E::EVENT_TYPE.to_string()));
        }
        self.decoders.insert(E::EVENT_TYPE, decode_as::<E>);
        Ok(self)
    }

    /// Decode `payload` stored under `event_type` into an envelope.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::UnknownEventType`] when nothing is registered for `event_type`
    /// - [`RegistryError::Decode`] or [`RegistryError::TypeMismatch`] when the payload is bad
    pub fn decode(&self, event_type: &str, payload: &[u8]) -> Result<EventEnvelope, RegistryError> {
        let decoder = self
            .decoders
            .get(event_type)
            .ok_or_else(|| RegistryError::UnknownEventType(event_type.to_string()))?;
        decoder(payload)
    }

    /// Whether a decoder is registered for `event_type`.
    #[must_use]
    pub fn contains(&self, event_type: &str) -> bool {
        self.decoders.contains_key(event_type)
    }

    /// Registered discriminators, sorted.
    #[must_use]
    pub fn event_types(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.decoders.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Number of registered event types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

impl std::fmt::Debug for EventTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventTypeRegistry")
            .field("event_types", &self.event_types())
            .finish()
    }
}
