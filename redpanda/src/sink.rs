//! Producer side: [`RedpandaSink`].

use crate::error::{RedpandaError, classify_kafka_error};
use ledger_events_core::broker::{BrokerError, BrokerFuture, BrokerMessage, MessageSink};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use std::time::Duration;

/// Default partition count for topics this sink creates.
pub const DEFAULT_TOPIC_PARTITIONS: i32 = 3;
/// Default replication factor for topics this sink creates.
pub const DEFAULT_REPLICATION_FACTOR: i32 = 1;

const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_ACKS: &str = "all";
const DEFAULT_COMPRESSION: &str = "none";

/// [`MessageSink`] over an rdkafka [`FutureProducer`].
///
/// Sends wait for the broker acknowledgment (`acks=all` by default). Topics are
/// created through the admin API with a fixed partition count and replication
/// factor; creating a topic that already exists succeeds.
///
/// # Example
///
/// ```no_run
/// use ledger_events_redpanda::RedpandaSink;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let sink = RedpandaSink::builder()
///     .brokers("localhost:9092")
///     .compression("lz4")
///     .send_timeout(Duration::from_secs(2))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaSink {
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
    brokers: String,
    send_timeout: Duration,
    partitions: i32,
    replication: i32,
}

impl RedpandaSink {
    /// Create a sink with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`RedpandaError::ClientCreation`] if librdkafka rejects the configuration.
    pub fn new(brokers: &str) -> Result<Self, RedpandaError> {
        Self::builder().brokers(brokers).build()
    }

    /// Start configuring a sink.
    #[must_use]
    pub fn builder() -> RedpandaSinkBuilder {
        RedpandaSinkBuilder::default()
    }

    /// Bootstrap servers.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }
}

impl std::fmt::Debug for RedpandaSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaSink")
            .field("brokers", &self.brokers)
            .field("send_timeout", &self.send_timeout)
            .field("partitions", &self.partitions)
            .field("replication", &self.replication)
            .finish_non_exhaustive()
    }
}

impl MessageSink for RedpandaSink {
    fn send(&self, message: BrokerMessage) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let headers = owned_headers(&message.headers);
            let record = FutureRecord::to(&message.topic)
                .key(&message.key)
                .payload(&message.payload)
                .headers(headers)
                .timestamp(message.timestamp.timestamp_millis());

            match self
                .producer
                .send(record, Timeout::After(self.send_timeout))
                .await
            {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %message.topic,
                        partition = partition,
                        offset = offset,
                        key = %message.key,
                        "Message delivered"
                    );
                    Ok(())
                },
                Err((kafka_error, _)) => {
                    Err(classify_kafka_error(&kafka_error, &message.topic, self.send_timeout))
                },
            }
        })
    }

    fn ensure_topics(&self, topics: &[String]) -> BrokerFuture<'_, ()> {
        let topics = topics.to_vec();
        Box::pin(async move {
            let new_topics: Vec<NewTopic<'_>> = topics
                .iter()
                .map(|name| {
                    NewTopic::new(name, self.partitions, TopicReplication::Fixed(self.replication))
                })
                .collect();
            let options = AdminOptions::new().operation_timeout(Some(self.send_timeout));

            let results = self
                .admin
                .create_topics(&new_topics, &options)
                .await
                .map_err(|e| BrokerError::Admin(e.to_string()))?;

            for result in results {
                match result {
                    Ok(topic) => tracing::info!(
                        topic = %topic,
                        partitions = self.partitions,
                        replication = self.replication,
                        "Topic created"
                    ),
                    Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                        tracing::debug!(topic = %topic, "Topic already exists");
                    },
                    Err((topic, code)) => {
                        return Err(BrokerError::Admin(format!(
                            "Failed to create topic '{topic}': {code}"
                        )));
                    },
                }
            }
            Ok(())
        })
    }
}

fn owned_headers(headers: &[(String, String)]) -> OwnedHeaders {
    headers
        .iter()
        .fold(OwnedHeaders::new_with_capacity(headers.len()), |acc, (key, value)| {
            acc.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            })
        })
}

/// Builder for [`RedpandaSink`].
#[derive(Debug, Default)]
pub struct RedpandaSinkBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    send_timeout: Option<Duration>,
    partitions: Option<i32>,
    replication: Option<i32>,
}

impl RedpandaSinkBuilder {
    /// Comma-separated bootstrap servers (required).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgment mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"all"`
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"`, `"zstd"`.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Upper bound on delivery of one message, including librdkafka's internal retries.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    /// Partition count for created topics.
    #[must_use]
    pub const fn topic_partitions(mut self, partitions: i32) -> Self {
        self.partitions = Some(partitions);
        self
    }

    /// Replication factor for created topics.
    #[must_use]
    pub const fn replication_factor(mut self, replication: i32) -> Self {
        self.replication = Some(replication);
        self
    }

    /// Build the sink.
    ///
    /// # Errors
    ///
    /// Returns [`RedpandaError::MissingSetting`] without brokers and
    /// [`RedpandaError::ClientCreation`] if librdkafka rejects the configuration.
    pub fn build(self) -> Result<RedpandaSink, RedpandaError> {
        let brokers = self
            .brokers
            .filter(|b| !b.trim().is_empty())
            .ok_or(RedpandaError::MissingSetting("brokers"))?;
        let send_timeout = self
            .send_timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(DEFAULT_SEND_TIMEOUT);
        let acks = self.producer_acks.as_deref().unwrap_or(DEFAULT_ACKS);
        let compression = self.compression.as_deref().unwrap_or(DEFAULT_COMPRESSION);

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", send_timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| RedpandaError::ClientCreation {
                client: "producer",
                reason: e.to_string(),
            })?;

        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .create()
            .map_err(|e| RedpandaError::ClientCreation {
                client: "admin client",
                reason: e.to_string(),
            })?;

        let partitions = self
            .partitions
            .filter(|p| *p > 0)
            .unwrap_or(DEFAULT_TOPIC_PARTITIONS);
        let replication = self
            .replication
            .filter(|r| *r > 0)
            .unwrap_or(DEFAULT_REPLICATION_FACTOR);

        tracing::info!(
            brokers = %brokers,
            acks = acks,
            compression = compression,
            send_timeout_ms = send_timeout.as_millis(),
            "Redpanda sink created"
        );

        Ok(RedpandaSink {
            producer,
            admin,
            brokers,
            send_timeout,
            partitions,
            replication,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use rdkafka::message::Headers;

    #[test]
    fn redpanda_sink_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaSink>();
        assert_sync::<RedpandaSink>();
    }

    #[test]
    fn builder_requires_brokers() {
        assert_eq!(
            RedpandaSink::builder().build().unwrap_err(),
            RedpandaError::MissingSetting("brokers")
        );
        assert_eq!(
            RedpandaSink::builder().brokers("  ").build().unwrap_err(),
            RedpandaError::MissingSetting("brokers")
        );
    }

    #[test]
    fn builder_applies_topic_defaults() {
        let sink = RedpandaSink::builder()
            .brokers("localhost:9092")
            .topic_partitions(0)
            .build()
            .expect("client creation does not connect");

        assert_eq!(sink.brokers(), "localhost:9092");
        assert_eq!(sink.partitions, DEFAULT_TOPIC_PARTITIONS);
        assert_eq!(sink.replication, DEFAULT_REPLICATION_FACTOR);
        assert_eq!(sink.send_timeout, DEFAULT_SEND_TIMEOUT);
    }

    #[test]
    fn headers_keep_order() {
        let headers = owned_headers(&[
            ("event_type".to_string(), "AccountCreated".to_string()),
            ("event_id".to_string(), "evt-1".to_string()),
        ]);

        assert_eq!(headers.count(), 2);
        let first = headers.get(0);
        assert_eq!(first.key, "event_type");
        assert_eq!(first.value, Some(&b"AccountCreated"[..]));
        assert_eq!(headers.get(1).key, "event_id");
    }
}
