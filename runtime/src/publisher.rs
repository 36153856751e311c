//! Broker publisher with a dead-letter fallback.
//!
//! [`EventPublisher`] turns an [`EventEnvelope`] into a [`BrokerMessage`] and
//! sends it through a [`MessageSink`] under a short per-call timeout. The same
//! publisher writes to the dead-letter topic (`<topic>-dlq`).
//!
//! # Failure asymmetry
//!
//! Primary publish failures are returned to the caller. Dead-letter failures
//! are not: [`EventPublisher::publish_to_dlq`] always succeeds and only logs,
//! because the outbox record stays the source of truth and the caller must not
//! loop on a dead-letter failure. The outbox processor uses
//! [`EventPublisher::try_publish_to_dlq`] instead, which reports the failure so
//! the record can be left untouched for the next sweep.

use chrono::SecondsFormat;
use ledger_events_core::broker::{
    BrokerError, BrokerMessage, HEADER_ERROR, HEADER_EVENT_ID, HEADER_EVENT_TYPE,
    HEADER_FAILURE_TIME, HEADER_ORIGINAL_TOPIC, MessageSink,
};
use ledger_events_core::clock::{Clock, SystemClock};
use ledger_events_core::event::{DomainEvent, EventEnvelope};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Suffix appended to the primary topic to name the dead-letter topic.
pub const DLQ_SUFFIX: &str = "-dlq";

/// Default per-call publish timeout.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors returned by [`EventPublisher`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The envelope cannot be published as it is.
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// The broker did not acknowledge within the publish timeout.
    #[error("Publish to '{topic}' timed out after {timeout:?}")]
    Timeout {
        /// Destination topic.
        topic: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// The broker client reported an error.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl PublishError {
    /// Whether the failure is due to broker or network availability.
    ///
    /// Infrastructure failures do not count against an outbox record's retries.
    #[must_use]
    pub fn is_infrastructure(&self) -> bool {
        match self {
            Self::InvalidEnvelope(_) => false,
            Self::Timeout { .. } => true,
            Self::Broker(err) => err.is_infrastructure(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::InvalidEnvelope(_) => "invalid",
            Self::Timeout { .. } => "timeout",
            Self::Broker(err) if err.is_infrastructure() => "unavailable",
            Self::Broker(_) => "rejected",
        }
    }
}

/// Publishes envelopes to a primary topic and its dead-letter topic.
///
/// # Example
///
/// ```
/// use ledger_events_runtime::publisher::EventPublisher;
/// use ledger_events_testing::InMemoryBroker;
/// use std::sync::Arc;
///
/// let broker = InMemoryBroker::new();
/// let publisher = EventPublisher::new(Arc::new(broker), "account-events");
/// assert_eq!(publisher.dlq_topic(), "account-events-dlq");
/// ```
pub struct EventPublisher {
    sink: Arc<dyn MessageSink>,
    topic: String,
    dlq_topic: String,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl EventPublisher {
    /// Create a publisher for `topic`; the dead-letter topic is `topic + "-dlq"`.
    #[must_use]
    pub fn new(sink: Arc<dyn MessageSink>, topic: impl Into<String>) -> Self {
        let topic = topic.into();
        Self {
            sink,
            dlq_topic: format!("{topic}{DLQ_SUFFIX}"),
            topic,
            timeout: DEFAULT_PUBLISH_TIMEOUT,
            clock: Arc::new(SystemClock),
        }
    }

    /// Override the per-call timeout. A zero timeout falls back to the default.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = if timeout.is_zero() {
            DEFAULT_PUBLISH_TIMEOUT
        } else {
            timeout
        };
        self
    }

    /// Override the clock used for the dead-letter `failure_time` header.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Primary topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Dead-letter topic.
    #[must_use]
    pub fn dlq_topic(&self) -> &str {
        &self.dlq_topic
    }

    /// Per-call timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Publish `envelope` to the primary topic.
    ///
    /// The aggregate id becomes the partition key, so events of one aggregate
    /// keep their order on the broker.
    ///
    /// # Errors
    ///
    /// - [`PublishError::InvalidEnvelope`] if the event type or aggregate id is empty
    /// - [`PublishError::Timeout`] if the broker does not acknowledge in time
    /// - [`PublishError::Broker`] if the broker reports a failure
    pub async fn publish(&self, envelope: &EventEnvelope) -> Result<(), PublishError> {
        validate(envelope)?;
        let message = self.primary_message(envelope);

        tracing::debug!(
            topic = %self.topic,
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            aggregate_id = %envelope.aggregate_id,
            "Publishing event"
        );

        self.send(message).await
    }

    /// Serialize `event` and publish it to the primary topic.
    ///
    /// # Errors
    ///
    /// [`PublishError::InvalidEnvelope`] if serialization fails, otherwise as
    /// [`publish`](Self::publish).
    pub async fn publish_event<E: DomainEvent>(&self, event: &E) -> Result<(), PublishError> {
        let envelope = EventEnvelope::from_event(event)
            .map_err(|e| PublishError::InvalidEnvelope(e.to_string()))?;
        self.publish(&envelope).await
    }

    /// Forward `envelope` to the dead-letter topic, swallowing any failure.
    ///
    /// Failures are logged at error level. This never returns an error so
    /// callers on the business write path cannot end up retrying a
    /// dead-letter failure.
    pub async fn publish_to_dlq(&self, envelope: &EventEnvelope, reason: &str) {
        if let Err(e) = self.try_publish_to_dlq(envelope, reason).await {
            tracing::error!(
                topic = %self.dlq_topic,
                event_id = %envelope.id,
                event_type = %envelope.event_type,
                reason = %reason,
                error = %e,
                "Failed to publish event to dead-letter topic"
            );
        }
    }

    /// Forward `envelope` to the dead-letter topic and report the outcome.
    ///
    /// The message keeps the original key, payload and headers and adds
    /// `error`, `original_topic` and `failure_time` (RFC 3339).
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Timeout`] or [`PublishError::Broker`] when the
    /// dead-letter send fails.
    pub async fn try_publish_to_dlq(
        &self,
        envelope: &EventEnvelope,
        reason: &str,
    ) -> Result<(), PublishError> {
        let mut message = self.primary_message(envelope);
        message.topic.clone_from(&self.dlq_topic);
        message.headers.extend([
            (HEADER_ERROR.to_string(), reason.to_string()),
            (HEADER_ORIGINAL_TOPIC.to_string(), self.topic.clone()),
            (
                HEADER_FAILURE_TIME.to_string(),
                self.clock
                    .now()
                    .to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
        ]);

        self.send(message).await?;

        tracing::warn!(
            topic = %self.dlq_topic,
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            reason = %reason,
            "Event forwarded to dead-letter topic"
        );
        Ok(())
    }

    /// Create the primary and dead-letter topics if they are missing.
    ///
    /// Best effort: failures are logged as warnings because the broker may
    /// auto-create topics.
    pub async fn provision_topics(&self) {
        let topics = [self.topic.clone(), self.dlq_topic.clone()];
        match self.sink.ensure_topics(&topics).await {
            Ok(()) => tracing::info!(topic = %self.topic, dlq = %self.dlq_topic, "Topics ready"),
            Err(e) => tracing::warn!(
                topic = %self.topic,
                dlq = %self.dlq_topic,
                error = %e,
                "Topic provisioning failed, relying on broker auto-creation"
            ),
        }
    }

    fn primary_message(&self, envelope: &EventEnvelope) -> BrokerMessage {
        BrokerMessage {
            topic: self.topic.clone(),
            key: envelope.aggregate_id.clone(),
            payload: envelope.payload.clone(),
            headers: vec![
                (HEADER_EVENT_TYPE.to_string(), envelope.event_type.clone()),
                (HEADER_EVENT_ID.to_string(), envelope.id.to_string()),
            ],
            timestamp: envelope.occurred_at,
        }
    }

    async fn send(&self, message: BrokerMessage) -> Result<(), PublishError> {
        let topic = message.topic.clone();
        let started = Instant::now();

        let result = match tokio::time::timeout(self.timeout, self.sink.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(PublishError::Broker(e)),
            Err(_) => Err(PublishError::Timeout {
                topic: topic.clone(),
                timeout: self.timeout,
            }),
        };

        metrics::histogram!("publisher_send_duration_seconds", "topic" => topic.clone())
            .record(started.elapsed().as_secs_f64());
        match &result {
            Ok(()) => {
                metrics::counter!("publisher_messages_sent_total", "topic" => topic).increment(1);
            },
            Err(e) => {
                metrics::counter!(
                    "publisher_send_errors_total",
                    "topic" => topic,
                    "kind" => e.kind()
                )
                .increment(1);
            },
        }
        result
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("topic", &self.topic)
            .field("dlq_topic", &self.dlq_topic)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn validate(envelope: &EventEnvelope) -> Result<(), PublishError> {
    if envelope.event_type.is_empty() {
        return Err(PublishError::InvalidEnvelope(format!(
            "event {} has no event type",
            envelope.id
        )));
    }
    if envelope.aggregate_id.is_empty() {
        return Err(PublishError::InvalidEnvelope(format!(
            "event {} has no aggregate id",
            envelope.id
        )));
    }
    Ok(())
}
