//! Event consumer: dispatches broker messages to per-type handlers.
//!
//! Delivery is at-least-once. The read position is committed only after the
//! handler for a message returns `Ok`, or when no handler is registered for
//! its type. A handler error rewinds the source so the same message is fetched
//! again, which means handlers must be idempotent. If the rewind itself fails
//! the consumer keeps the message and retries it in place; nothing later in
//! the partition is fetched or committed until it succeeds.
//!
//! # Event type resolution
//!
//! 1. The `event_type` header
//! 2. Otherwise the `event_type` field embedded in the JSON payload
//!
//! A message whose type cannot be resolved either way is logged and committed
//! so it cannot block its partition.

use crate::retry::{Backoff, RetryPolicy};
use ledger_events_core::broker::{BrokerError, HEADER_EVENT_TYPE, InboundMessage, MessageSource};
use ledger_events_core::handler::{EventHandler, HandlerContext};
use ledger_events_core::registry::{
    EventTypeRegistry, RegistryError, embedded_event_type, validate_event_type,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Default pause before a message whose handler failed is fetched again.
pub const DEFAULT_REDELIVERY_DELAY: Duration = Duration::from_millis(500);

/// Errors returned by [`EventConsumer`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// The handler declares a malformed event type.
    #[error(transparent)]
    InvalidHandler(#[from] RegistryError),

    /// The handler's event type is not among the known event types.
    #[error("No known event type named {0}")]
    UnknownEventType(String),

    /// The consumer was stopped and cannot be started again.
    #[error("Consumer already stopped")]
    Stopped,

    /// The consumer loop is already running.
    #[error("Consumer already running")]
    AlreadyRunning,

    /// The broker source failed to shut down.
    #[error("Failed to close message source: {0}")]
    Close(BrokerError),
}

/// How the consumer resolved one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Handled,
    Unhandled,
    Poison,
    /// Handler failed and the source was rewound to the message.
    Rewound,
    /// Handler failed and the rewind failed too; the message must be retried
    /// without fetching.
    Held,
}

/// Reads a topic and dispatches each message to the handler for its event type.
///
/// # Example
///
/// ```
/// use ledger_events_runtime::consumer::EventConsumer;
/// use ledger_events_testing::{InMemoryBroker, RecordingHandler};
/// use std::sync::Arc;
///
/// let broker = InMemoryBroker::new();
/// let mut consumer = EventConsumer::new(Arc::new(broker.source("account-events")));
/// consumer
///     .register_handler(Arc::new(RecordingHandler::new("AccountCreated")))
///     .unwrap();
/// assert_eq!(consumer.handled_event_types(), vec!["AccountCreated"]);
/// ```
pub struct EventConsumer {
    source: Arc<dyn MessageSource>,
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    known_types: Option<BTreeSet<String>>,
    fetch_retry: RetryPolicy,
    redelivery_delay: Duration,
    stop: CancellationToken,
    running: AtomicBool,
}

impl EventConsumer {
    /// Create a consumer reading from `source`.
    #[must_use]
    pub fn new(source: Arc<dyn MessageSource>) -> Self {
        Self {
            source,
            handlers: HashMap::new(),
            known_types: None,
            fetch_retry: RetryPolicy::default(),
            redelivery_delay: DEFAULT_REDELIVERY_DELAY,
            stop: CancellationToken::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Only accept handlers for event types registered in `registry`.
    #[must_use]
    pub fn with_known_types(mut self, registry: &EventTypeRegistry) -> Self {
        self.known_types = Some(
            registry
                .event_types()
                .into_iter()
                .map(str::to_string)
                .collect(),
        );
        self
    }

    /// Backoff applied between failed fetches.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.fetch_retry = policy;
        self
    }

    /// Pause before a message whose handler failed is fetched again.
    #[must_use]
    pub const fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    /// Register `handler` for the event type it declares.
    ///
    /// The last registration for a type wins; the replaced handler is returned.
    ///
    /// # Errors
    ///
    /// - [`ConsumerError::InvalidHandler`] if the declared type is empty or has whitespace
    /// - [`ConsumerError::UnknownEventType`] if known types were configured and the
    ///   declared type is not one of them
    pub fn register_handler(
        &mut self,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Option<Arc<dyn EventHandler>>, ConsumerError> {
        let event_type = handler.event_type().to_string();
        validate_event_type(&event_type)?;
        if let Some(known) = &self.known_types {
            if !known.contains(&event_type) {
                return Err(ConsumerError::UnknownEventType(event_type));
            }
        }

        let previous = self.handlers.insert(event_type.clone(), handler);
        if previous.is_some() {
            tracing::warn!(event_type = %event_type, "Replacing previously registered handler");
        } else {
            tracing::debug!(event_type = %event_type, "Handler registered");
        }
        Ok(previous)
    }

    /// Event types with a registered handler, sorted.
    #[must_use]
    pub fn handled_event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Consume until `cancel` fires or [`stop`](Self::stop) is called.
    ///
    /// Cancellation is checked before every fetch; a message already fetched is
    /// handled to completion first. The source is closed on exit.
    ///
    /// # Errors
    ///
    /// - [`ConsumerError::Stopped`] if the consumer was stopped before starting
    /// - [`ConsumerError::AlreadyRunning`] if another `start` call is active
    /// - [`ConsumerError::Close`] if the source fails to close
    pub async fn start(&self, cancel: CancellationToken) -> Result<(), ConsumerError> {
        if self.stop.is_cancelled() {
            return Err(ConsumerError::Stopped);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ConsumerError::AlreadyRunning);
        }

        tracing::info!(handlers = ?self.handled_event_types(), "Consumer started");
        self.consume(&cancel).await;

        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Consumer stopped");
        self.source.close().map_err(ConsumerError::Close)
    }

    /// Signal the loop to finish. Calling it again has no effect.
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            tracing::info!("Consumer stop requested");
            self.stop.cancel();
        }
    }

    /// Whether [`stop`](Self::stop) was called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    async fn consume(&self, cancel: &CancellationToken) {
        let mut backoff = Backoff::new(self.fetch_retry.clone());
        let mut held: Option<InboundMessage> = None;

        loop {
            if cancel.is_cancelled() || self.stop.is_cancelled() {
                break;
            }

            let message = if let Some(message) = held.take() {
                message
            } else {
                let fetched = tokio::select! {
                    () = cancel.cancelled() => break,
                    () = self.stop.cancelled() => break,
                    fetched = self.source.fetch() => fetched,
                };

                match fetched {
                    Ok(message) => {
                        backoff.reset();
                        message
                    },
                    Err(BrokerError::Closed) => {
                        tracing::warn!("Message source closed, stopping consumer");
                        break;
                    },
                    Err(e) => {
                        let delay = backoff.next_delay();
                        metrics::counter!("consumer_fetch_errors_total").increment(1);
                        tracing::warn!(
                            error = %e,
                            attempt = backoff.attempts(),
                            delay_ms = delay.as_millis(),
                            "Failed to fetch message, backing off"
                        );
                        if self.pause(delay, cancel).await {
                            break;
                        }
                        continue;
                    },
                }
            };

            match self.dispatch(&message, cancel).await {
                Disposition::Handled | Disposition::Unhandled | Disposition::Poison => {},
                Disposition::Rewound => {
                    if self.pause(self.redelivery_delay, cancel).await {
                        break;
                    }
                },
                Disposition::Held => {
                    held = Some(message);
                    if self.pause(self.redelivery_delay, cancel).await {
                        break;
                    }
                },
            }
        }
    }

    async fn dispatch(&self, message: &InboundMessage, cancel: &CancellationToken) -> Disposition {
        let Some(event_type) = resolve_event_type(message) else {
            tracing::error!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "Cannot determine event type, skipping message"
            );
            metrics::counter!("consumer_poison_messages_total").increment(1);
            self.commit(message).await;
            return Disposition::Poison;
        };

        let Some(handler) = self.handlers.get(&event_type) else {
            tracing::debug!(event_type = %event_type, offset = message.offset, "No handler registered");
            self.commit(message).await;
            return Disposition::Unhandled;
        };

        let shutdown = self.stop.child_token();
        let ctx = HandlerContext {
            event_type: event_type.clone(),
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            key: message.key.clone(),
            cancellation: shutdown.clone(),
        };

        // The handler always runs to completion; shutdown is only signalled to it.
        let mut run = handler.handle(&ctx, &message.payload);
        let finished = tokio::select! {
            result = &mut run => Some(result),
            () = cancel.cancelled() => None,
        };
        let handled = match finished {
            Some(result) => result,
            None => {
                shutdown.cancel();
                run.await
            },
        };

        match handled {
            Ok(()) => {
                metrics::counter!("consumer_messages_handled_total", "event_type" => event_type)
                    .increment(1);
                self.commit(message).await;
                Disposition::Handled
            },
            Err(e) => {
                metrics::counter!("consumer_handler_errors_total", "event_type" => event_type.clone())
                    .increment(1);
                tracing::warn!(
                    event_type = %event_type,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Handler failed, message will be redelivered"
                );
                match self.source.redeliver(message).await {
                    Ok(()) => Disposition::Rewound,
                    Err(e) => {
                        tracing::error!(
                            partition = message.partition,
                            offset = message.offset,
                            error = %e,
                            "Failed to rewind to failed message, retrying it in place"
                        );
                        Disposition::Held
                    },
                }
            },
        }
    }

    async fn commit(&self, message: &InboundMessage) {
        if let Err(e) = self.source.commit(message).await {
            // The next successful commit covers this offset too.
            tracing::warn!(
                partition = message.partition,
                offset = message.offset,
                error = %e,
                "Failed to commit offset"
            );
        }
    }

    /// Sleep for `delay`; returns `true` if shutdown was requested meanwhile.
    async fn pause(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            () = cancel.cancelled() => true,
            () = self.stop.cancelled() => true,
            () = tokio::time::sleep(delay) => false,
        }
    }
}

impl std::fmt::Debug for EventConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventConsumer")
            .field("handlers", &self.handled_event_types())
            .field("redelivery_delay", &self.redelivery_delay)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

fn resolve_event_type(message: &InboundMessage) -> Option<String> {
    message
        .header(HEADER_EVENT_TYPE)
        .filter(|event_type| !event_type.is_empty())
        .map(str::to_string)
        .or_else(|| embedded_event_type(&message.payload))
        .filter(|event_type| !event_type.is_empty())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use ledger_events_core::account::account_registry;
    use ledger_events_core::broker::BrokerMessage;
    use ledger_events_core::handler::HandlerError;
    use ledger_events_testing::{InMemoryBroker, InMemorySource, RecordingHandler};

    const TOPIC: &str = "account-events";

    fn message(event_type: Option<&str>, payload: &str) -> BrokerMessage {
        BrokerMessage {
            topic: TOPIC.to_string(),
            key: "acct-1".to_string(),
            payload: payload.as_bytes().to_vec(),
            headers: event_type
                .map(|t| vec![(HEADER_EVENT_TYPE.to_string(), t.to_string())])
                .unwrap_or_default(),
            timestamp: Utc::now(),
        }
    }

    fn consumer(source: &InMemorySource) -> EventConsumer {
        EventConsumer::new(Arc::new(source.clone()))
            .with_redelivery_delay(Duration::from_millis(1))
            .with_retry_policy(
                RetryPolicy::builder()
                    .initial_delay(Duration::from_millis(1))
                    .max_delay(Duration::from_millis(5))
                    .build(),
            )
    }

    /// Drive the consumer until `done` holds, then cancel it.
    async fn run_until(consumer: &EventConsumer, done: impl Fn() -> bool) {
        let cancel = CancellationToken::new();
        let watcher = cancel.clone();
        let run = consumer.start(cancel);
        let wait = async move {
            while !done() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            watcher.cancel();
        };

        let (result, ()) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(run, wait)
        })
        .await
        .expect("consumer did not reach the expected state");
        result.unwrap();
    }

    #[tokio::test]
    async fn handled_message_is_committed() {
        let broker = InMemoryBroker::new();
        broker.append(message(Some("AccountCreated"), "{}"));
        let source = broker.source(TOPIC);
        let handler = RecordingHandler::new("AccountCreated");
        let mut consumer = consumer(&source);
        consumer.register_handler(Arc::new(handler.clone())).unwrap();

        run_until(&consumer, || source.committed() == vec![0]).await;

        assert_eq!(handler.calls(), 1);
        assert_eq!(handler.deliveries()[0].key.as_deref(), Some("acct-1"));
        assert!(source.is_closed());
    }

    #[tokio::test]
    async fn failed_handler_gets_the_same_message_again() {
        let broker = InMemoryBroker::new();
        broker.append(message(Some("AccountDeposited"), r#"{"amount":1}"#));
        let source = broker.source(TOPIC);
        let handler = RecordingHandler::new("AccountDeposited").failing_times(2);
        let mut consumer = consumer(&source);
        consumer.register_handler(Arc::new(handler.clone())).unwrap();

        run_until(&consumer, || handler.successes() == 1).await;

        let deliveries = handler.deliveries();
        assert_eq!(deliveries.len(), 3);
        assert!(deliveries.iter().all(|d| d.offset == 0));
        assert!(deliveries.iter().all(|d| d.payload == br#"{"amount":1}"#.to_vec()));
        assert_eq!(source.redelivered(), vec![0, 0]);
        assert_eq!(source.committed(), vec![0]);
    }

    #[tokio::test]
    async fn failed_rewind_retries_the_message_in_place() {
        let broker = InMemoryBroker::new();
        broker.append(message(Some("AccountCreated"), "{}"));
        broker.append(message(Some("AccountCreated"), "{}"));
        let source = broker.source(TOPIC);
        source.fail_next_redeliver(BrokerError::Other("Local: Erroneous state".into()));
        source.fail_next_redeliver(BrokerError::Other("Local: Erroneous state".into()));
        let handler = RecordingHandler::new("AccountCreated").failing_times(2);
        let mut consumer = consumer(&source);
        consumer.register_handler(Arc::new(handler.clone())).unwrap();

        run_until(&consumer, || source.committed().len() == 2).await;

        let offsets: Vec<_> = handler.deliveries().iter().map(|d| d.offset).collect();
        assert_eq!(offsets, vec![0, 0, 0, 1]);
        assert_eq!(source.committed(), vec![0, 1]);
        assert!(source.redelivered().is_empty());
    }

    #[tokio::test]
    async fn successful_message_is_not_redelivered() {
        let broker = InMemoryBroker::new();
        broker.append(message(Some("AccountCreated"), "{}"));
        broker.append(message(Some("AccountCreated"), "{}"));
        let source = broker.source(TOPIC);
        let handler = RecordingHandler::new("AccountCreated");
        let mut consumer = consumer(&source);
        consumer.register_handler(Arc::new(handler.clone())).unwrap();

        run_until(&consumer, || source.committed().len() == 2).await;

        let offsets: Vec<_> = handler.deliveries().iter().map(|d| d.offset).collect();
        assert_eq!(offsets, vec![0, 1]);
        assert!(source.redelivered().is_empty());
    }

    #[tokio::test]
    async fn message_without_handler_is_committed() {
        let broker = InMemoryBroker::new();
        broker.append(message(Some("AccountBlocked"), "{}"));
        let source = broker.source(TOPIC);
        let consumer = consumer(&source);

        run_until(&consumer, || source.committed() == vec![0]).await;
    }

    #[tokio::test]
    async fn event_type_falls_back_to_payload() {
        let broker = InMemoryBroker::new();
        broker.append(message(None, r#"{"event_type":"AccountCreated","id":"x"}"#));
        let source = broker.source(TOPIC);
        let handler = RecordingHandler::new("AccountCreated");
        let mut consumer = consumer(&source);
        consumer.register_handler(Arc::new(handler.clone())).unwrap();

        run_until(&consumer, || handler.calls() == 1).await;
    }

    #[tokio::test]
    async fn untyped_message_is_skipped() {
        let broker = InMemoryBroker::new();
        broker.append(message(None, "not json"));
        broker.append(message(Some("AccountCreated"), "{}"));
        let source = broker.source(TOPIC);
        let handler = RecordingHandler::new("AccountCreated");
        let mut consumer = consumer(&source);
        consumer.register_handler(Arc::new(handler.clone())).unwrap();

        run_until(&consumer, || source.committed() == vec![0, 1]).await;

        assert_eq!(handler.calls(), 1);
        assert_eq!(handler.deliveries()[0].offset, 1);
    }

    #[tokio::test]
    async fn fetch_errors_are_retried() {
        let broker = InMemoryBroker::new();
        broker.append(message(Some("AccountCreated"), "{}"));
        let source = broker.source(TOPIC);
        source.fail_next_fetch(BrokerError::FetchFailed("broker transport failure".into()));
        source.fail_next_fetch(BrokerError::FetchFailed("broker transport failure".into()));
        let handler = RecordingHandler::new("AccountCreated");
        let mut consumer = consumer(&source);
        consumer.register_handler(Arc::new(handler.clone())).unwrap();

        run_until(&consumer, || handler.calls() == 1).await;
    }

    #[tokio::test]
    async fn commit_failure_does_not_redeliver() {
        let broker = InMemoryBroker::new();
        broker.append(message(Some("AccountCreated"), "{}"));
        broker.append(message(Some("AccountCreated"), "{}"));
        let source = broker.source(TOPIC);
        source.fail_next_commit(BrokerError::CommitFailed("coordinator moved".into()));
        let handler = RecordingHandler::new("AccountCreated");
        let mut consumer = consumer(&source);
        consumer.register_handler(Arc::new(handler.clone())).unwrap();

        run_until(&consumer, || source.committed() == vec![1]).await;

        assert_eq!(handler.calls(), 2);
    }

    #[test]
    fn last_registration_wins() {
        let broker = InMemoryBroker::new();
        let mut consumer = consumer(&broker.source(TOPIC));

        let first = consumer
            .register_handler(Arc::new(RecordingHandler::new("AccountCreated")))
            .unwrap();
        let second = consumer
            .register_handler(Arc::new(RecordingHandler::new("AccountCreated")))
            .unwrap();

        assert!(first.is_none());
        assert!(second.is_some());
        assert_eq!(consumer.handled_event_types(), vec!["AccountCreated"]);
    }

    #[test]
    fn registration_is_validated() {
        let broker = InMemoryBroker::new();
        let mut consumer =
            consumer(&broker.source(TOPIC)).with_known_types(&account_registry().unwrap());

        assert!(matches!(
            consumer.register_handler(Arc::new(RecordingHandler::new(""))),
            Err(ConsumerError::InvalidHandler(_))
        ));
        assert!(matches!(
            consumer.register_handler(Arc::new(RecordingHandler::new("AccountCreatd"))),
            Err(ConsumerError::UnknownEventType(t)) if t == "AccountCreatd"
        ));
        assert!(
            consumer
                .register_handler(Arc::new(RecordingHandler::new("AccountCreated")))
                .is_ok()
        );
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_final() {
        let broker = InMemoryBroker::new();
        let source = broker.source(TOPIC);
        let consumer = consumer(&source);

        consumer.stop();
        consumer.stop();

        assert!(consumer.is_stopped());
        assert_eq!(
            consumer.start(CancellationToken::new()).await,
            Err(ConsumerError::Stopped)
        );
    }

    #[tokio::test]
    async fn stop_ends_a_waiting_consumer() {
        let broker = InMemoryBroker::new();
        let source = broker.source(TOPIC);
        let consumer = Arc::new(consumer(&source));

        let running = Arc::clone(&consumer);
        let task = tokio::spawn(async move { running.start(CancellationToken::new()).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        consumer.stop();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(source.is_closed());
    }

    /// Handler that waits for shutdown before returning.
    struct SlowHandler;

    #[async_trait]
    impl EventHandler for SlowHandler {
        fn event_type(&self) -> &str {
            "AccountCreated"
        }

        async fn handle(&self, ctx: &HandlerContext, _payload: &[u8]) -> Result<(), HandlerError> {
            ctx.cancellation.cancelled().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn stop_signals_the_in_flight_handler() {
        let broker = InMemoryBroker::new();
        broker.append(message(Some("AccountCreated"), "{}"));
        let source = broker.source(TOPIC);
        let mut consumer = consumer(&source);
        consumer.register_handler(Arc::new(SlowHandler)).unwrap();
        let consumer = Arc::new(consumer);

        let running = Arc::clone(&consumer);
        let task = tokio::spawn(async move { running.start(CancellationToken::new()).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        consumer.stop();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("handler never saw the stop request")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(source.committed(), vec![0]);
    }

    #[tokio::test]
    async fn in_flight_message_finishes_before_shutdown() {
        let broker = InMemoryBroker::new();
        broker.append(message(Some("AccountCreated"), "{}"));
        let source = broker.source(TOPIC);
        let mut consumer = consumer(&source);
        consumer.register_handler(Arc::new(SlowHandler)).unwrap();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        consumer.start(cancel).await.unwrap();

        assert_eq!(source.committed(), vec![0]);
    }
}
