//! Outbox processor: the background task that drains the outbox to the broker.
//!
//! Every tick the processor fetches a bounded batch of records, oldest first,
//! and handles them one at a time:
//!
//! ```text
//! retry_count > max_retries ──► dead-letter ──ok──► mark published
//!          │                        └─err──► leave untouched (next sweep)
//!          ▼
//!   decode by event type ──unknown──► skip (logged)
//!          │        └─bad payload──► mark failed
//!          ▼
//!       publish ──ok──► mark published
//!          ├─infrastructure error──► leave untouched (no retry charged)
//!          └─other error──► mark failed (retry_count + 1)
//! ```
//!
//! Infrastructure failures never charge a retry, so a broker outage cannot
//! push deliverable events into the dead-letter topic.
//!
//! A single processor per outbox is assumed; there is no row claiming.

use crate::publisher::{EventPublisher, PublishError};
use ledger_events_core::event::EventEnvelope;
use ledger_events_core::outbox::{OutboxError, OutboxRecord, OutboxStore};
use ledger_events_core::registry::{EventTypeRegistry, RegistryError};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Default number of records fetched per sweep.
pub const DEFAULT_BATCH_SIZE: usize = 50;
/// Default time between sweeps.
pub const DEFAULT_PROCESSING_INTERVAL: Duration = Duration::from_secs(5);
/// Default number of charged failures tolerated before dead-lettering.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Dead-letter reason for records that ran out of retries.
pub const RETRIES_EXHAUSTED_REASON: &str = "max retries exceeded";

/// Identical consecutive batch errors are logged once per this many repeats.
const ERROR_LOG_EVERY: u32 = 10;

/// Outbox processor settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxProcessorConfig {
    /// Records fetched per sweep.
    pub batch_size: usize,
    /// Time between sweeps.
    pub processing_interval: Duration,
    /// A record is dead-lettered once its `retry_count` exceeds this.
    pub max_retries: u32,
    /// Whether `failed` records are polled again alongside `pending` ones.
    pub retry_failed: bool,
}

impl Default for OutboxProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            processing_interval: DEFAULT_PROCESSING_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_failed: true,
        }
    }
}

impl OutboxProcessorConfig {
    /// Create a new config builder.
    #[must_use]
    pub const fn builder() -> OutboxProcessorConfigBuilder {
        OutboxProcessorConfigBuilder {
            batch_size: None,
            processing_interval: None,
            max_retries: None,
            retry_failed: None,
        }
    }
}

/// Builder for [`OutboxProcessorConfig`].
///
/// Zero values fall back to the defaults.
#[derive(Debug, Clone)]
pub struct OutboxProcessorConfigBuilder {
    batch_size: Option<usize>,
    processing_interval: Option<Duration>,
    max_retries: Option<u32>,
    retry_failed: Option<bool>,
}

impl OutboxProcessorConfigBuilder {
    /// Set records fetched per sweep.
    #[must_use]
    pub const fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Set time between sweeps.
    #[must_use]
    pub const fn processing_interval(mut self, interval: Duration) -> Self {
        self.processing_interval = Some(interval);
        self
    }

    /// Set the retry limit.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set whether `failed` records are polled again.
    #[must_use]
    pub const fn retry_failed(mut self, retry_failed: bool) -> Self {
        self.retry_failed = Some(retry_failed);
        self
    }

    /// Build the [`OutboxProcessorConfig`].
    #[must_use]
    pub fn build(self) -> OutboxProcessorConfig {
        OutboxProcessorConfig {
            batch_size: self
                .batch_size
                .filter(|size| *size > 0)
                .unwrap_or(DEFAULT_BATCH_SIZE),
            processing_interval: self
                .processing_interval
                .filter(|interval| !interval.is_zero())
                .unwrap_or(DEFAULT_PROCESSING_INTERVAL),
            max_retries: self
                .max_retries
                .filter(|retries| *retries > 0)
                .unwrap_or(DEFAULT_MAX_RETRIES),
            retry_failed: self.retry_failed.unwrap_or(true),
        }
    }
}

/// Outcome counts of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Records fetched.
    pub fetched: usize,
    /// Records published to the primary topic and marked published.
    pub published: usize,
    /// Exhausted records forwarded to the dead-letter topic and marked published.
    pub dead_lettered: usize,
    /// Exhausted records whose dead-letter send failed; left for the next sweep.
    pub dead_letter_failures: usize,
    /// Records charged a retry.
    pub failed: usize,
    /// Records left untouched after an infrastructure failure.
    pub deferred: usize,
    /// Records with an unregistered event type.
    pub skipped: usize,
    /// Records whose status update failed after the broker send; seen again next sweep.
    pub mark_failures: usize,
}

impl BatchReport {
    /// Whether the sweep found nothing to do.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.fetched == 0
    }
}

/// Coalesces identical consecutive batch errors in the log.
///
/// The first occurrence of an error is emitted, then every 10th repeat of the
/// same message. A different message, or a successful sweep, starts over.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RepeatedErrorLog {
    last_message: Option<String>,
    repeat_count: u32,
}

impl RepeatedErrorLog {
    /// Create an empty log state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            last_message: None,
            repeat_count: 0,
        }
    }

    /// Register an error occurrence; returns whether it should be logged.
    pub fn observe(&mut self, message: &str) -> bool {
        if self.last_message.as_deref() == Some(message) {
            self.repeat_count += 1;
            self.repeat_count % ERROR_LOG_EVERY == 0
        } else {
            self.last_message = Some(message.to_string());
            self.repeat_count = 0;
            true
        }
    }

    /// Number of repeats of the current message after its first occurrence.
    #[must_use]
    pub const fn repeat_count(&self) -> u32 {
        self.repeat_count
    }

    /// Forget the current message after a successful sweep.
    pub fn reset(&mut self) {
        self.last_message = None;
        self.repeat_count = 0;
    }
}

/// Drains an [`OutboxStore`] through an [`EventPublisher`].
///
/// # Example
///
/// ```
/// use ledger_events_core::account::account_registry;
/// use ledger_events_runtime::processor::{OutboxProcessor, OutboxProcessorConfig};
/// use ledger_events_runtime::publisher::EventPublisher;
/// use ledger_events_testing::{InMemoryBroker, InMemoryOutboxStore};
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let publisher = EventPublisher::new(Arc::new(InMemoryBroker::new()), "account-events");
/// let processor = OutboxProcessor::new(
///     Arc::new(InMemoryOutboxStore::new()),
///     Arc::new(publisher),
///     account_registry().unwrap(),
///     OutboxProcessorConfig::default(),
/// );
///
/// let report = processor.process_next_batch().await.unwrap();
/// assert!(report.is_empty());
/// # }
/// ```
pub struct OutboxProcessor {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<EventPublisher>,
    registry: EventTypeRegistry,
    config: OutboxProcessorConfig,
    error_log: RepeatedErrorLog,
}

impl OutboxProcessor {
    /// Create a processor.
    #[must_use]
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<EventPublisher>,
        registry: EventTypeRegistry,
        config: OutboxProcessorConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            registry,
            config,
            error_log: RepeatedErrorLog::new(),
        }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &OutboxProcessorConfig {
        &self.config
    }

    /// Fetch one batch and handle every record in it, in order.
    ///
    /// Per-record failures are absorbed into the report; they never abort the
    /// batch.
    ///
    /// # Errors
    ///
    /// Returns the store error if the batch cannot be fetched.
    pub async fn process_next_batch(&self) -> Result<BatchReport, OutboxError> {
        let records = if self.config.retry_failed {
            self.store
                .get_retryable_events(self.config.batch_size)
                .await?
        } else {
            self.store.get_pending_events(self.config.batch_size).await?
        };

        let mut report = BatchReport {
            fetched: records.len(),
            ..BatchReport::default()
        };
        if records.is_empty() {
            tracing::trace!("No pending events in outbox");
            return Ok(report);
        }

        tracing::debug!(count = records.len(), "Processing outbox batch");
        for record in records {
            self.process_record(record, &mut report).await;
        }

        metrics::counter!("outbox_published_total").increment(report.published as u64);
        metrics::counter!("outbox_dead_lettered_total").increment(report.dead_lettered as u64);
        metrics::counter!("outbox_failed_total").increment(report.failed as u64);
        metrics::counter!("outbox_deferred_total").increment(report.deferred as u64);
        metrics::counter!("outbox_skipped_total").increment(report.skipped as u64);

        tracing::info!(
            fetched = report.fetched,
            published = report.published,
            dead_lettered = report.dead_lettered,
            failed = report.failed,
            deferred = report.deferred,
            skipped = report.skipped,
            mark_failures = report.mark_failures,
            "Outbox batch processed"
        );
        Ok(report)
    }

    /// Run one sweep, applying duplicate suppression to batch errors.
    ///
    /// Returns the report, or `None` if the batch could not be fetched.
    pub async fn sweep(&mut self) -> Option<BatchReport> {
        match self.process_next_batch().await {
            Ok(report) => {
                self.error_log.reset();
                Some(report)
            },
            Err(e) => {
                metrics::counter!("outbox_batch_errors_total").increment(1);
                let message = e.to_string();
                if self.error_log.observe(&message) {
                    tracing::error!(
                        error = %message,
                        repeats = self.error_log.repeat_count(),
                        "Failed to process outbox batch"
                    );
                }
                None
            },
        }
    }

    /// Sweep every `processing_interval` until `cancel` fires.
    ///
    /// Cancellation is observed between sweeps; a sweep in progress always
    /// finishes its current batch.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.processing_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            topic = %self.publisher.topic(),
            batch_size = self.config.batch_size,
            interval_ms = self.config.processing_interval.as_millis(),
            max_retries = self.config.max_retries,
            retry_failed = self.config.retry_failed,
            "Outbox processor started"
        );

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.sweep().await;
                }
            }
        }

        tracing::info!("Outbox processor stopped");
    }

    /// Spawn [`run`](Self::run) on the current tokio runtime.
    #[must_use]
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    fn is_exhausted(&self, record: &OutboxRecord) -> bool {
        i64::from(record.retry_count) > i64::from(self.config.max_retries)
    }

    async fn process_record(&self, record: OutboxRecord, report: &mut BatchReport) {
        if self.is_exhausted(&record) {
            self.dead_letter(&record, report).await;
            return;
        }

        let envelope = match self.registry.decode(&record.event_type, &record.payload) {
            Ok(envelope) => envelope,
            Err(RegistryError::UnknownEventType(event_type)) => {
                tracing::warn!(
                    record_id = %record.id,
                    event_type = %event_type,
                    "Unknown event type in outbox, skipping"
                );
                report.skipped += 1;
                return;
            },
            Err(e) => {
                tracing::warn!(
                    record_id = %record.id,
                    event_type = %record.event_type,
                    error = %e,
                    "Outbox payload does not decode"
                );
                self.mark_failed(&record, e.to_string(), report).await;
                return;
            },
        };

        match self.publisher.publish(&envelope).await {
            Ok(()) => {
                if let Err(e) = self.store.mark_as_published(record.id).await {
                    tracing::error!(
                        record_id = %record.id,
                        error = %e,
                        "Published event could not be marked as published"
                    );
                    report.mark_failures += 1;
                    return;
                }
                report.published += 1;
            },
            Err(e) if e.is_infrastructure() => {
                tracing::warn!(
                    record_id = %record.id,
                    event_type = %record.event_type,
                    error = %e,
                    "Broker unavailable, event will be retried on the next sweep"
                );
                report.deferred += 1;
            },
            Err(e) => {
                tracing::warn!(
                    record_id = %record.id,
                    event_type = %record.event_type,
                    retry_count = record.retry_count,
                    error = %e,
                    "Event publish failed"
                );
                self.mark_failed(&record, e.to_string(), report).await;
            },
        }
    }

    async fn dead_letter(&self, record: &OutboxRecord, report: &mut BatchReport) {
        // A payload that no longer decodes is still forwarded as stored.
        let envelope = self
            .registry
            .decode(&record.event_type, &record.payload)
            .unwrap_or_else(|_| raw_envelope(record));

        if let Err(e) = self
            .publisher
            .try_publish_to_dlq(&envelope, RETRIES_EXHAUSTED_REASON)
            .await
        {
            log_dead_letter_failure(record, &e);
            report.dead_letter_failures += 1;
            return;
        }

        match self.store.mark_as_published(record.id).await {
            Ok(()) => report.dead_lettered += 1,
            Err(e) => {
                tracing::error!(
                    record_id = %record.id,
                    error = %e,
                    "Dead-lettered event could not be marked as published"
                );
                report.mark_failures += 1;
            },
        }
    }

    async fn mark_failed(&self, record: &OutboxRecord, error: String, report: &mut BatchReport) {
        match self.store.mark_as_failed(record.id, error).await {
            Ok(()) => report.failed += 1,
            Err(e) => {
                tracing::error!(
                    record_id = %record.id,
                    error = %e,
                    "Failed event could not be marked as failed"
                );
                report.mark_failures += 1;
            },
        }
    }
}

impl std::fmt::Debug for OutboxProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxProcessor")
            .field("publisher", &self.publisher)
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn raw_envelope(record: &OutboxRecord) -> EventEnvelope {
    EventEnvelope::new(
        record.id,
        record.event_type.clone(),
        record.aggregate_id.clone(),
        record.payload.clone(),
        record.created_at,
    )
}

fn log_dead_letter_failure(record: &OutboxRecord, error: &PublishError) {
    tracing::error!(
        record_id = %record.id,
        event_type = %record.event_type,
        retry_count = record.retry_count,
        error = %error,
        "Dead-letter publish failed, record left for the next sweep"
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use chrono::Utc;
    use ledger_events_core::account::{AccountCreated, account_registry};
    use ledger_events_core::broker::{BrokerError, HEADER_ERROR, HEADER_EVENT_TYPE};
    use ledger_events_core::event::DomainEvent;
    use ledger_events_core::outbox::{NewOutboxRecord, OutboxStatus};
    use ledger_events_testing::{InMemoryBroker, InMemoryOutboxStore};
    use uuid::Uuid;

    const TOPIC: &str = "account-events";
    const DLQ: &str = "account-events-dlq";

    struct Fixture {
        store: InMemoryOutboxStore,
        broker: InMemoryBroker,
        processor: OutboxProcessor,
    }

    fn fixture(config: OutboxProcessorConfig) -> Fixture {
        let store = InMemoryOutboxStore::new();
        let broker = InMemoryBroker::new();
        let publisher = EventPublisher::new(Arc::new(broker.clone()), TOPIC);
        let processor = OutboxProcessor::new(
            Arc::new(store.clone()),
            Arc::new(publisher),
            account_registry().unwrap(),
            config,
        );
        Fixture {
            store,
            broker,
            processor,
        }
    }

    async fn save_created(store: &InMemoryOutboxStore, account_id: &str) -> Uuid {
        let event = AccountCreated::new(account_id, "Ada", "ada@example.com", Utc::now());
        store
            .save(NewOutboxRecord::from_event(&event).unwrap())
            .await
            .unwrap()
    }

    fn seeded_record(retry_count: i32, event_type: &str, payload: Vec<u8>) -> OutboxRecord {
        let now = Utc::now();
        OutboxRecord {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            aggregate_id: "acct-9".to_string(),
            payload,
            status: OutboxStatus::Failed,
            retry_count,
            last_error: Some("earlier failure".to_string()),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn config_zero_values_fall_back_to_defaults() {
        let config = OutboxProcessorConfig::builder()
            .batch_size(0)
            .processing_interval(Duration::ZERO)
            .max_retries(0)
            .build();

        assert_eq!(config, OutboxProcessorConfig::default());
    }

    #[test]
    fn repeated_errors_are_logged_every_tenth_time() {
        let mut log = RepeatedErrorLog::new();

        let emitted: Vec<bool> = (0..21).map(|_| log.observe("db down")).collect();

        let emitted_at: Vec<usize> = emitted
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.then_some(i))
            .collect();
        assert_eq!(emitted_at, vec![0, 10, 20]);
    }

    #[test]
    fn new_error_message_is_logged_immediately() {
        let mut log = RepeatedErrorLog::new();
        assert!(log.observe("db down"));
        assert!(!log.observe("db down"));
        assert!(log.observe("disk full"));

        log.reset();
        assert!(log.observe("disk full"));
    }

    #[tokio::test]
    async fn healthy_sweep_publishes_and_marks_records() {
        let f = fixture(OutboxProcessorConfig::default());
        let id = save_created(&f.store, "acct-1").await;

        let report = f.processor.process_next_batch().await.unwrap();

        assert_eq!(report.published, 1);
        assert_eq!(f.store.get(id).unwrap().status, OutboxStatus::Published);
        let sent = f.broker.messages(TOPIC);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].key, "acct-1");
        assert_eq!(sent[0].header(HEADER_EVENT_TYPE), Some("AccountCreated"));
    }

    #[tokio::test]
    async fn infrastructure_failure_leaves_record_untouched() {
        let f = fixture(OutboxProcessorConfig::default());
        let id = save_created(&f.store, "acct-1").await;
        f.broker
            .fail_sends(TOPIC, BrokerError::Unavailable("all brokers down".into()));

        for _ in 0..3 {
            let report = f.processor.process_next_batch().await.unwrap();
            assert_eq!(report.deferred, 1);
        }

        let record = f.store.get(id).unwrap();
        assert_eq!(record.status, OutboxStatus::Pending);
        assert_eq!(record.retry_count, 0);

        f.broker.heal(TOPIC);
        f.processor.process_next_batch().await.unwrap();
        assert_eq!(f.store.get(id).unwrap().status, OutboxStatus::Published);
    }

    #[tokio::test]
    async fn rejection_charges_a_retry() {
        let f = fixture(OutboxProcessorConfig::default());
        let id = save_created(&f.store, "acct-1").await;
        f.broker.fail_next_send(
            TOPIC,
            BrokerError::Rejected {
                topic: TOPIC.into(),
                reason: "Message size too large".into(),
            },
        );

        let report = f.processor.process_next_batch().await.unwrap();

        assert_eq!(report.failed, 1);
        let record = f.store.get(id).unwrap();
        assert_eq!(record.status, OutboxStatus::Failed);
        assert_eq!(record.retry_count, 1);
        assert!(record.last_error.unwrap().contains("Message size too large"));
    }

    #[tokio::test]
    async fn failed_records_are_retried_by_default() {
        let f = fixture(OutboxProcessorConfig::default());
        let id = save_created(&f.store, "acct-1").await;
        f.store.mark_as_failed(id, "transient rejection".into()).await.unwrap();

        f.processor.process_next_batch().await.unwrap();

        assert_eq!(f.store.get(id).unwrap().status, OutboxStatus::Published);
    }

    #[tokio::test]
    async fn pending_only_polling_leaves_failed_records() {
        let f = fixture(OutboxProcessorConfig::builder().retry_failed(false).build());
        let id = save_created(&f.store, "acct-1").await;
        f.store.mark_as_failed(id, "transient rejection".into()).await.unwrap();

        let report = f.processor.process_next_batch().await.unwrap();

        assert!(report.is_empty());
        assert_eq!(f.store.get(id).unwrap().status, OutboxStatus::Failed);
    }

    #[tokio::test]
    async fn unknown_event_type_is_skipped_without_side_effects() {
        let f = fixture(OutboxProcessorConfig::default());
        let id = f
            .store
            .save(NewOutboxRecord::new("AccountClosed", "acct-1", &serde_json::json!({})).unwrap())
            .await
            .unwrap();

        let report = f.processor.process_next_batch().await.unwrap();

        assert_eq!(report.skipped, 1);
        let record = f.store.get(id).unwrap();
        assert_eq!(record.status, OutboxStatus::Pending);
        assert_eq!(record.retry_count, 0);
        assert_eq!(f.broker.send_attempts(TOPIC), 0);
    }

    #[tokio::test]
    async fn undecodable_payload_is_marked_failed() {
        let f = fixture(OutboxProcessorConfig::default());
        let id = f
            .store
            .save(NewOutboxRecord::new("AccountCreated", "acct-1", &"not an event").unwrap())
            .await
            .unwrap();

        let report = f.processor.process_next_batch().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(f.store.get(id).unwrap().retry_count, 1);
        assert_eq!(f.broker.send_attempts(TOPIC), 0);
    }

    #[tokio::test]
    async fn exhausted_record_is_dead_lettered_and_marked_published() {
        let f = fixture(OutboxProcessorConfig::default());
        let event = AccountCreated::new("acct-9", "Ada", "ada@example.com", Utc::now());
        let record = seeded_record(6, "AccountCreated", event.to_payload().unwrap());
        let id = record.id;
        f.store.insert_record(record);

        let report = f.processor.process_next_batch().await.unwrap();

        assert_eq!(report.dead_lettered, 1);
        assert_eq!(f.store.get(id).unwrap().status, OutboxStatus::Published);
        let dead = f.broker.messages(DLQ);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].header(HEADER_ERROR), Some(RETRIES_EXHAUSTED_REASON));
        assert!(f.broker.messages(TOPIC).is_empty());

        // Terminal: never reprocessed.
        let again = f.processor.process_next_batch().await.unwrap();
        assert!(again.is_empty());
        assert_eq!(f.broker.messages(DLQ).len(), 1);
    }

    #[tokio::test]
    async fn unmarked_dead_letter_is_not_counted() {
        let f = fixture(OutboxProcessorConfig::default());
        let event = AccountCreated::new("acct-9", "Ada", "ada@example.com", Utc::now());
        let record = seeded_record(6, "AccountCreated", event.to_payload().unwrap());
        let id = record.id;
        f.store.insert_record(record);
        f.store.fail_marks("connection reset by peer");

        let report = f.processor.process_next_batch().await.unwrap();

        assert_eq!(report.dead_lettered, 0);
        assert_eq!(report.mark_failures, 1);
        assert_eq!(f.broker.messages(DLQ).len(), 1);
        assert_eq!(f.store.get(id).unwrap().status, OutboxStatus::Failed);

        f.store.heal();
        let retried = f.processor.process_next_batch().await.unwrap();
        assert_eq!(retried.dead_lettered, 1);
        assert_eq!(f.store.get(id).unwrap().status, OutboxStatus::Published);
    }

    #[tokio::test]
    async fn record_at_the_limit_is_still_published() {
        let f = fixture(OutboxProcessorConfig::default());
        let event = AccountCreated::new("acct-9", "Ada", "ada@example.com", Utc::now());
        let record = seeded_record(5, "AccountCreated", event.to_payload().unwrap());
        f.store.insert_record(record);

        let report = f.processor.process_next_batch().await.unwrap();

        assert_eq!(report.published, 1);
        assert!(f.broker.messages(DLQ).is_empty());
    }

    #[tokio::test]
    async fn failed_dead_letter_leaves_record_for_next_sweep() {
        let f = fixture(OutboxProcessorConfig::default());
        let record = seeded_record(6, "AccountCreated", b"corrupt".to_vec());
        let id = record.id;
        f.store.insert_record(record);
        f.broker
            .fail_next_send(DLQ, BrokerError::Unavailable("all brokers down".into()));

        let first = f.processor.process_next_batch().await.unwrap();
        assert_eq!(first.dead_letter_failures, 1);
        let untouched = f.store.get(id).unwrap();
        assert_eq!(untouched.status, OutboxStatus::Failed);
        assert_eq!(untouched.retry_count, 6);

        let second = f.processor.process_next_batch().await.unwrap();
        assert_eq!(second.dead_lettered, 1);
        assert_eq!(f.store.get(id).unwrap().status, OutboxStatus::Published);
        // The raw payload is forwarded even though it no longer decodes.
        assert_eq!(f.broker.messages(DLQ)[0].payload, b"corrupt".to_vec());
        assert_eq!(f.broker.send_attempts(DLQ), 2);
    }

    #[tokio::test]
    async fn batch_is_bounded_and_oldest_first() {
        let f = fixture(OutboxProcessorConfig::builder().batch_size(2).build());
        for account in ["acct-1", "acct-2", "acct-3"] {
            save_created(&f.store, account).await;
        }

        let report = f.processor.process_next_batch().await.unwrap();

        assert_eq!(report.fetched, 2);
        let keys: Vec<_> = f.broker.messages(TOPIC).into_iter().map(|m| m.key).collect();
        assert_eq!(keys, vec!["acct-1", "acct-2"]);
    }

    #[tokio::test]
    async fn sweep_swallows_fetch_errors() {
        let mut f = fixture(OutboxProcessorConfig::default());
        f.store.fail_fetches("connection refused");

        assert!(f.processor.sweep().await.is_none());
        assert!(f.processor.sweep().await.is_none());
        assert_eq!(f.processor.error_log.repeat_count(), 1);

        f.store.heal();
        assert!(f.processor.sweep().await.is_some());
        assert_eq!(f.processor.error_log, RepeatedErrorLog::new());
    }

    #[tokio::test(start_paused = true)]
    async fn run_sweeps_until_cancelled() {
        let f = fixture(
            OutboxProcessorConfig::builder()
                .processing_interval(Duration::from_millis(100))
                .build(),
        );
        let store = f.store.clone();
        let cancel = CancellationToken::new();
        let handle = f.processor.spawn(cancel.clone());

        let id = save_created(&store, "acct-1").await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(store.get(id).unwrap().status, OutboxStatus::Published);

        cancel.cancel();
        handle.await.unwrap();
    }
}
