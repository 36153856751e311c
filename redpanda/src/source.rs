//! Consumer side: [`RedpandaSource`].

use crate::error::RedpandaError;
use chrono::DateTime;
use ledger_events_core::broker::{BrokerError, BrokerFuture, InboundMessage, MessageSource};
use rdkafka::Offset;
use rdkafka::TopicPartitionList;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const DEFAULT_AUTO_OFFSET_RESET: &str = "earliest";
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(6);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// [`MessageSource`] over an rdkafka [`StreamConsumer`] in a consumer group.
///
/// Auto-commit is disabled: the position only advances when
/// [`commit`](MessageSource::commit) is called, so a crash between fetch and
/// commit redelivers the message to the group.
///
/// # Example
///
/// ```no_run
/// use ledger_events_redpanda::RedpandaSource;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let source = RedpandaSource::builder()
///     .brokers("localhost:9092")
///     .group_id("account-events-worker")
///     .topic("account-events")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaSource {
    consumer: StreamConsumer,
    topic: String,
    group_id: String,
    closed: AtomicBool,
}

impl RedpandaSource {
    /// Start configuring a source.
    #[must_use]
    pub fn builder() -> RedpandaSourceBuilder {
        RedpandaSourceBuilder::default()
    }

    /// Subscribed topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Consumer group id.
    #[must_use]
    pub fn group_id(&self) -> &str {
        &self.group_id
    }
}

impl std::fmt::Debug for RedpandaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaSource")
            .field("topic", &self.topic)
            .field("group_id", &self.group_id)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MessageSource for RedpandaSource {
    fn fetch(&self) -> BrokerFuture<'_, InboundMessage> {
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(BrokerError::Closed);
            }

            let message = self
                .consumer
                .recv()
                .await
                .map_err(|e| BrokerError::FetchFailed(e.to_string()))?;

            Ok(to_inbound(&message))
        })
    }

    fn commit<'a>(&'a self, message: &'a InboundMessage) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let mut positions = TopicPartitionList::new();
            positions
                .add_partition_offset(
                    &message.topic,
                    message.partition,
                    Offset::Offset(message.offset + 1),
                )
                .map_err(|e| BrokerError::CommitFailed(e.to_string()))?;

            self.consumer
                .commit(&positions, CommitMode::Async)
                .map_err(|e| BrokerError::CommitFailed(e.to_string()))
        })
    }

    fn redeliver<'a>(&'a self, message: &'a InboundMessage) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.consumer
                .seek(
                    &message.topic,
                    message.partition,
                    Offset::Offset(message.offset),
                    SEEK_TIMEOUT,
                )
                .map_err(|e| BrokerError::Other(format!("Failed to seek: {e}")))
        })
    }

    fn close(&self) -> Result<(), BrokerError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.consumer.unsubscribe();
            tracing::info!(
                topic = %self.topic,
                group_id = %self.group_id,
                "Consumer left group"
            );
        }
        Ok(())
    }
}

fn to_inbound(message: &BorrowedMessage<'_>) -> InboundMessage {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|header| {
                    let value = header
                        .value
                        .map(|v| String::from_utf8_lossy(v).into_owned())
                        .unwrap_or_default();
                    (header.key.to_string(), value)
                })
                .collect()
        })
        .unwrap_or_default();

    InboundMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message
            .key()
            .map(|key| String::from_utf8_lossy(key).into_owned()),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        headers,
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(DateTime::from_timestamp_millis),
    }
}

/// Builder for [`RedpandaSource`].
#[derive(Debug, Default)]
pub struct RedpandaSourceBuilder {
    brokers: Option<String>,
    group_id: Option<String>,
    topic: Option<String>,
    auto_offset_reset: Option<String>,
    session_timeout: Option<Duration>,
}

impl RedpandaSourceBuilder {
    /// Comma-separated bootstrap servers (required).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Consumer group id (required).
    #[must_use]
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Topic to subscribe to (required).
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Where a group without a committed position starts reading.
    ///
    /// Default: `"earliest"`
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Group session timeout.
    ///
    /// Default: 6 seconds
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Create the consumer and subscribe it to the topic.
    ///
    /// # Errors
    ///
    /// Returns [`RedpandaError::MissingSetting`] for a missing required setting,
    /// [`RedpandaError::ClientCreation`] if librdkafka rejects the configuration
    /// and [`RedpandaError::Subscription`] if subscribing fails.
    pub fn build(self) -> Result<RedpandaSource, RedpandaError> {
        let brokers = required(self.brokers, "brokers")?;
        let group_id = required(self.group_id, "group_id")?;
        let topic = required(self.topic, "topic")?;
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| DEFAULT_AUTO_OFFSET_RESET.to_string());
        let session_timeout = self.session_timeout.unwrap_or(DEFAULT_SESSION_TIMEOUT);

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("group.id", &group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &auto_offset_reset)
            .set("session.timeout.ms", session_timeout.as_millis().to_string())
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| RedpandaError::ClientCreation {
                client: "consumer",
                reason: e.to_string(),
            })?;

        consumer
            .subscribe(&[topic.as_str()])
            .map_err(|e| RedpandaError::Subscription {
                topic: topic.clone(),
                reason: e.to_string(),
            })?;

        tracing::info!(
            brokers = %brokers,
            topic = %topic,
            group_id = %group_id,
            auto_offset_reset = %auto_offset_reset,
            manual_commit = true,
            "Subscribed to topic"
        );

        Ok(RedpandaSource {
            consumer,
            topic,
            group_id,
            closed: AtomicBool::new(false),
        })
    }
}

fn required(value: Option<String>, name: &'static str) -> Result<String, RedpandaError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(RedpandaError::MissingSetting(name))
}
