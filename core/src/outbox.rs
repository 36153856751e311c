//! Outbox record types and the store abstraction.
//!
//! The outbox is the durable source of truth for events that still have to reach
//! the broker. A business operation inserts a record alongside its state change;
//! the outbox processor later drains it. Records are never deleted here.
//!
//! # Record lifecycle
//!
//! ```text
//!            save
//!             │
//!             ▼
//!        ┌─────────┐  publish ok / forwarded to DLQ   ┌───────────┐
//!        │ pending │ ───────────────────────────────► │ published │
//!        └────┬────┘                                   └───────────┘
//!             │ non-infrastructure failure                   ▲
//!             ▼                                              │
//!        ┌─────────┐  retried, or DLQ once exhausted         │
//!        │ failed  │ ────────────────────────────────────────┘
//!        └─────────┘
//! ```
//!
//! # Implementations
//!
//! - `PostgresOutboxStore` (in `ledger-events-postgres`): production
//! - `InMemoryOutboxStore` (in `ledger-events-testing`): tests

use crate::event::{DomainEvent, EventError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// Errors from outbox store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OutboxError {
    /// The backing database failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// The payload could not be serialized.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// No record exists with this id.
    #[error("Outbox record not found: {0}")]
    NotFound(Uuid),

    /// A stored status string is not a known status.
    #[error("Invalid outbox status: {0}")]
    InvalidStatus(String),
}

impl From<EventError> for OutboxError {
    fn from(err: EventError) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// Delivery status of an outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboxStatus {
    /// Awaiting publication.
    Pending,
    /// Delivered to the primary topic, or forwarded to the dead-letter topic.
    Published,
    /// Last attempt failed for a reason other than broker availability.
    Failed,
}

impl OutboxStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Published => "published",
            Self::Failed => "failed",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::InvalidStatus`] if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, OutboxError> {
        match s {
            "pending" => Ok(Self::Pending),
            "published" => Ok(Self::Published),
            "failed" => Ok(Self::Failed),
            _ => Err(OutboxError::InvalidStatus(s.to_string())),
        }
    }

    /// Whether the processor may still attempt delivery for this status.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted outbox entry.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    /// Record id (primary key).
    pub id: Uuid,
    /// Event type discriminator.
    pub event_type: String,
    /// Owning aggregate id.
    pub aggregate_id: String,
    /// Serialized domain event.
    pub payload: Vec<u8>,
    /// Delivery status.
    pub status: OutboxStatus,
    /// Number of non-infrastructure failures recorded so far.
    pub retry_count: i32,
    /// Most recent failure message.
    pub last_error: Option<String>,
    /// Insert time; defines FIFO order.
    pub created_at: DateTime<Utc>,
    /// Refreshed on every status or retry change.
    pub updated_at: DateTime<Utc>,
}

/// The input to [`OutboxStore::save`]: an event type, aggregate id and serialized payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutboxRecord {
    /// Event type discriminator.
    pub event_type: String,
    /// Owning aggregate id.
    pub aggregate_id: String,
    /// Serialized payload.
    pub payload: Vec<u8>,
}

impl NewOutboxRecord {
    /// Serialize `payload` to JSON and pair it with its type and aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::SerializationError`] if `payload` cannot be serialized.
    pub fn new<P: Serialize + ?Sized>(
        event_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: &P,
    ) -> Result<Self, OutboxError> {
        let payload =
            serde_json::to_vec(payload).map_err(|e| OutboxError::SerializationError(e.to_string()))?;
        Ok(Self {
            event_type: event_type.into(),
            aggregate_id: aggregate_id.into(),
            payload,
        })
    }

    /// Build the record input for a typed domain event.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::SerializationError`] if the event cannot be serialized.
    pub fn from_event<E: DomainEvent>(event: &E) -> Result<Self, OutboxError> {
        Ok(Self {
            event_type: event.event_type().to_string(),
            aggregate_id: event.aggregate_id().to_string(),
            payload: event.to_payload()?,
        })
    }
}

/// Boxed future returned by [`OutboxStore`] methods.
pub type OutboxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, OutboxError>> + Send + 'a>>;

/// Durable store of events awaiting publication.
///
/// All mutations address a single record by id and are atomic, so the store is
/// safe to share between request handlers inserting records and the processor
/// updating them.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so it can be used as `Arc<dyn OutboxStore>`.
pub trait OutboxStore: Send + Sync {
    /// Insert a new record with `status = pending` and `retry_count = 0`.
    ///
    /// Returns the new record's id.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the insert fails.
    fn save(&self, record: NewOutboxRecord) -> OutboxFuture<'_, Uuid>;

    /// Up to `limit` records with status `pending`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the query fails.
    fn get_pending_events(&self, limit: usize) -> OutboxFuture<'_, Vec<OutboxRecord>>;

    /// Up to `limit` records with status `pending` or `failed`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the query fails.
    fn get_retryable_events(&self, limit: usize) -> OutboxFuture<'_, Vec<OutboxRecord>>;

    /// Transition a record to `published`. Repeating the call is harmless.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::NotFound`] for an unknown id or
    /// [`OutboxError::DatabaseError`] if the update fails.
    fn mark_as_published(&self, id: Uuid) -> OutboxFuture<'_, ()>;

    /// Record a failed attempt: increment `retry_count`, store `error`, set `failed`.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::NotFound`] for an unknown id or
    /// [`OutboxError::DatabaseError`] if the update fails.
    fn mark_as_failed(&self, id: Uuid, error: String) -> OutboxFuture<'_, ()>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use crate::account::AccountCreated;

    #[test]
    fn status_roundtrip() {
        for status in &[
            OutboxStatus::Pending,
            OutboxStatus::Published,
            OutboxStatus::Failed,
        ] {
            let parsed = OutboxStatus::parse(status.as_str()).expect("valid status should parse");
            assert_eq!(*status, parsed);
        }
    }

    #[test]
    fn status_invalid() {
        assert_eq!(
            OutboxStatus::parse("dead"),
            Err(OutboxError::InvalidStatus("dead".to_string()))
        );
    }

    #[test]
    fn only_published_is_terminal() {
        assert!(OutboxStatus::Pending.is_retryable());
        assert!(OutboxStatus::Failed.is_retryable());
        assert!(!OutboxStatus::Published.is_retryable());
    }

    #[test]
    fn new_record_serializes_payload() {
        let record = NewOutboxRecord::new(
            "AccountCreated",
            "acct-1",
            &serde_json::json!({ "name": "Ada" }),
        )
        .unwrap();

        assert_eq!(record.event_type, "AccountCreated");
        assert_eq!(record.aggregate_id, "acct-1");
        assert_eq!(record.payload, br#"{"name":"Ada"}"#.to_vec());
    }

    #[test]
    fn new_record_from_event() {
        let event = AccountCreated::new("acct-2", "Ada", "ada@example.com", Utc::now());
        let record = NewOutboxRecord::from_event(&event).unwrap();

        assert_eq!(record.event_type, "AccountCreated");
        assert_eq!(record.aggregate_id, "acct-2");
        assert_eq!(record.payload, event.to_payload().unwrap());
    }
}
