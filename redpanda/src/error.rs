//! Mapping from rdkafka errors to [`BrokerError`].

use ledger_events_core::broker::BrokerError;
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use std::time::Duration;
use thiserror::Error;

/// Errors building a Redpanda client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RedpandaError {
    /// A required builder setting was not provided.
    #[error("Missing required setting: {0}")]
    MissingSetting(&'static str),

    /// librdkafka refused the client configuration.
    #[error("Failed to create {client}: {reason}")]
    ClientCreation {
        /// Which client was being created.
        client: &'static str,
        /// librdkafka's explanation.
        reason: String,
    },

    /// Subscribing the consumer to its topic failed.
    #[error("Failed to subscribe to '{topic}': {reason}")]
    Subscription {
        /// Topic being subscribed to.
        topic: String,
        /// librdkafka's explanation.
        reason: String,
    },
}

/// Classify a producer or admin error.
///
/// Connectivity and leadership problems become [`BrokerError::Unavailable`],
/// expired deadlines become [`BrokerError::Timeout`], and anything the broker
/// refused for the message itself becomes [`BrokerError::Rejected`].
#[must_use]
pub fn classify_kafka_error(err: &KafkaError, topic: &str, timeout: Duration) -> BrokerError {
    let Some(code) = err.rdkafka_error_code() else {
        return BrokerError::Other(err.to_string());
    };

    match code {
        RDKafkaErrorCode::AllBrokersDown
        | RDKafkaErrorCode::BrokerTransportFailure
        | RDKafkaErrorCode::BrokerNotAvailable
        | RDKafkaErrorCode::NetworkException
        | RDKafkaErrorCode::Resolve
        | RDKafkaErrorCode::LeaderNotAvailable
        | RDKafkaErrorCode::NotLeaderForPartition
        | RDKafkaErrorCode::UnknownTopicOrPartition
        | RDKafkaErrorCode::UnknownTopic
        | RDKafkaErrorCode::UnknownPartition
        | RDKafkaErrorCode::QueueFull => BrokerError::Unavailable(err.to_string()),

        RDKafkaErrorCode::MessageTimedOut
        | RDKafkaErrorCode::RequestTimedOut
        | RDKafkaErrorCode::OperationTimedOut => BrokerError::Timeout(timeout),

        _ => BrokerError::Rejected {
            topic: topic.to_string(),
            reason: err.to_string(),
        },
    }
}
