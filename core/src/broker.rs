//! Broker abstraction: outbound message sink and inbound message source.
//!
//! The publisher and the consumer talk to the broker only through
//! [`MessageSink`] and [`MessageSource`]. Production uses the rdkafka-backed
//! implementations in `ledger-events-redpanda`; tests use the in-memory broker in
//! `ledger-events-testing`.
//!
//! # Message layout
//!
//! | Field     | Content                                            |
//! |-----------|----------------------------------------------------|
//! | key       | aggregate id (partition key, per-aggregate order)  |
//! | value     | serialized domain event                            |
//! | timestamp | domain occurrence time                             |
//! | headers   | `event_type`, `event_id`; DLQ messages add `error`, `original_topic`, `failure_time` |

use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Header carrying the event type discriminator.
pub const HEADER_EVENT_TYPE: &str = "event_type";
/// Header carrying the event id.
pub const HEADER_EVENT_ID: &str = "event_id";
/// Dead-letter header carrying the failure reason.
pub const HEADER_ERROR: &str = "error";
/// Dead-letter header naming the topic the event was meant for.
pub const HEADER_ORIGINAL_TOPIC: &str = "original_topic";
/// Dead-letter header with the RFC 3339 failure time.
pub const HEADER_FAILURE_TIME: &str = "failure_time";

/// Error text fragments that identify broker or network unavailability.
///
/// Matched case-insensitively against error messages that carry no structured
/// classification.
pub const INFRASTRUCTURE_ERROR_SIGNATURES: &[&str] = &[
    "Unknown Topic Or Partition",
    "Leader Not Available",
    "Network Error",
    "Broker Not Available",
    "Connection Refused",
    "Connection Reset",
    "Connection Closed",
    "dial tcp",
    "i/o timeout",
    "timeout",
    "EOF",
    "broken pipe",
    "no such host",
];

/// Whether `message` matches one of [`INFRASTRUCTURE_ERROR_SIGNATURES`].
#[must_use]
pub fn matches_infrastructure_signature(message: &str) -> bool {
    let message = message.to_lowercase();
    INFRASTRUCTURE_ERROR_SIGNATURES
        .iter()
        .any(|signature| message.contains(&signature.to_lowercase()))
}

/// Errors that can occur talking to the broker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Brokers unreachable, connection refused or reset, no leader.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// The broker did not answer in time.
    #[error("Broker operation timed out after {0:?}")]
    Timeout(Duration),

    /// The broker refused the message.
    #[error("Message rejected by topic '{topic}': {reason}")]
    Rejected {
        /// Topic the message was sent to.
        topic: String,
        /// Broker-provided reason.
        reason: String,
    },

    /// Reading from the broker failed.
    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    /// Committing the consumer position failed.
    #[error("Commit failed: {0}")]
    CommitFailed(String),

    /// Administrative operation (topic creation) failed.
    #[error("Admin operation failed: {0}")]
    Admin(String),

    /// The source or sink has been closed.
    #[error("Broker client closed")]
    Closed,

    /// Anything else.
    #[error("Broker error: {0}")]
    Other(String),
}

impl BrokerError {
    /// Whether this failure is attributable to broker/network availability rather
    /// than to the message itself.
    #[must_use]
    pub fn is_infrastructure(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Timeout(_) | Self::FetchFailed(_) => true,
            Self::Rejected { reason, .. } => matches_infrastructure_signature(reason),
            Self::Other(message) | Self::Admin(message) | Self::CommitFailed(message) => {
                matches_infrastructure_signature(message)
            }
            Self::Closed => false,
        }
    }
}

/// An outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Destination topic.
    pub topic: String,
    /// Partition key.
    pub key: String,
    /// Message value.
    pub payload: Vec<u8>,
    /// Ordered header list.
    pub headers: Vec<(String, String)>,
    /// Message timestamp.
    pub timestamp: DateTime<Utc>,
}

impl BrokerMessage {
    /// First value of header `name`.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// A message read from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Source topic.
    pub topic: String,
    /// Partition the message was read from.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Partition key, if any.
    pub key: Option<String>,
    /// Message value.
    pub payload: Vec<u8>,
    /// Ordered header list.
    pub headers: Vec<(String, String)>,
    /// Broker timestamp, if any.
    pub timestamp: Option<DateTime<Utc>>,
}

impl InboundMessage {
    /// First value of header `name`.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

/// Boxed future returned by broker trait methods.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// Write side of the broker.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so it can be held as `Arc<dyn MessageSink>`.
pub trait MessageSink: Send + Sync {
    /// Send one message and wait for the broker acknowledgment.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] describing why the broker did not accept the message.
    fn send(&self, message: BrokerMessage) -> BrokerFuture<'_, ()>;

    /// Create `topics` if they do not exist. Existing topics are not an error.
    ///
    /// The default does nothing, for brokers that auto-create topics.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Admin`] if creation fails.
    fn ensure_topics(&self, topics: &[String]) -> BrokerFuture<'_, ()> {
        let _ = topics;
        Box::pin(async { Ok(()) })
    }
}

/// Read side of the broker, bound to one topic and consumer group.
///
/// Positions are committed explicitly; nothing is committed automatically.
pub trait MessageSource: Send + Sync {
    /// Wait for the next message.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::FetchFailed`] on transport errors or
    /// [`BrokerError::Closed`] once the source is closed.
    fn fetch(&self) -> BrokerFuture<'_, InboundMessage>;

    /// Commit the consumer position past `message`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::CommitFailed`] if the commit is not accepted.
    fn commit<'a>(&'a self, message: &'a InboundMessage) -> BrokerFuture<'a, ()>;

    /// Rewind so that `message` is returned by the next [`fetch`](Self::fetch).
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the position cannot be moved.
    fn redeliver<'a>(&'a self, message: &'a InboundMessage) -> BrokerFuture<'a, ()>;

    /// Leave the consumer group and release broker resources.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the client fails to shut down cleanly.
    fn close(&self) -> Result<(), BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn availability_errors_are_infrastructure() {
        assert!(BrokerError::Unavailable("all brokers down".into()).is_infrastructure());
        assert!(BrokerError::Timeout(Duration::from_secs(1)).is_infrastructure());
    }

    #[test]
    fn rejections_are_classified_by_signature() {
        let leader = BrokerError::Rejected {
            topic: "account-events".into(),
            reason: "Broker: Leader Not Available".into(),
        };
        let too_large = BrokerError::Rejected {
            topic: "account-events".into(),
            reason: "Broker: Message size too large".into(),
        };

        assert!(leader.is_infrastructure());
        assert!(!too_large.is_infrastructure());
    }

    #[test]
    fn signatures_match_case_insensitively() {
        assert!(matches_infrastructure_signature("read tcp: I/O TIMEOUT"));
        assert!(matches_infrastructure_signature("connection refused by peer"));
        assert!(matches_infrastructure_signature("unexpected EOF"));
        assert!(!matches_infrastructure_signature("invalid payload"));
    }

    #[test]
    fn closed_is_not_infrastructure() {
        assert!(!BrokerError::Closed.is_infrastructure());
    }

    #[test]
    fn header_lookup_returns_first_match() {
        let message = BrokerMessage {
            topic: "t".into(),
            key: "k".into(),
            payload: vec![],
            headers: vec![
                ("event_type".into(), "AccountCreated".into()),
                ("event_type".into(), "Shadowed".into()),
            ],
            timestamp: Utc::now(),
        };

        assert_eq!(message.header(HEADER_EVENT_TYPE), Some("AccountCreated"));
        assert_eq!(message.header(HEADER_ERROR), None);
    }
}
