//! Business write path: outbox first, then an optional direct publish.
//!
//! [`EventRecorder::record`] is what a command handler calls after changing
//! state. The outbox write comes first and is the durability guarantee; the
//! direct publish only lowers latency. Nothing here ever fails the business
//! operation: every delivery problem is logged and reported in the returned
//! [`RecordOutcome`].

use crate::publisher::EventPublisher;
use ledger_events_core::event::{DomainEvent, EventEnvelope};
use ledger_events_core::outbox::{NewOutboxRecord, OutboxStore};
use std::sync::Arc;
use uuid::Uuid;

/// What happened to one recorded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutcome {
    /// Id of the outbox record, if the outbox write succeeded.
    pub outbox_id: Option<Uuid>,
    /// Whether the direct publish to the primary topic succeeded.
    pub published: bool,
    /// Direct publish error forwarded to the dead-letter topic, if any.
    pub dead_letter_reason: Option<String>,
}

impl RecordOutcome {
    /// Whether the event is guaranteed to reach the broker eventually.
    #[must_use]
    pub const fn is_durable(&self) -> bool {
        self.outbox_id.is_some()
    }
}

/// Records domain events for delivery.
///
/// # Example
///
/// ```
/// use chrono::Utc;
/// use ledger_events_core::account::AccountCreated;
/// use ledger_events_runtime::publisher::EventPublisher;
/// use ledger_events_runtime::recorder::EventRecorder;
/// use ledger_events_testing::{InMemoryBroker, InMemoryOutboxStore};
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let publisher = EventPublisher::new(Arc::new(InMemoryBroker::new()), "account-events");
/// let recorder = EventRecorder::new(Arc::new(InMemoryOutboxStore::new()), Arc::new(publisher));
///
/// let event = AccountCreated::new("acct-1", "Ada", "ada@example.com", Utc::now());
/// let outcome = recorder.record(&event).await;
/// assert!(outcome.is_durable());
/// assert!(outcome.published);
/// # }
/// ```
pub struct EventRecorder {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<EventPublisher>,
}

impl EventRecorder {
    /// Create a recorder.
    #[must_use]
    pub fn new(store: Arc<dyn OutboxStore>, publisher: Arc<EventPublisher>) -> Self {
        Self { store, publisher }
    }

    /// Save `event` to the outbox, then try to publish it directly.
    ///
    /// - Outbox write fails: logged; the direct publish is still attempted.
    /// - Direct publish fails: the event is forwarded to the dead-letter topic
    ///   with the error text; the outbox record stays pending for the processor.
    /// - Direct publish succeeds: the outbox record is marked published so the
    ///   processor does not send it a second time.
    pub async fn record<E: DomainEvent>(&self, event: &E) -> RecordOutcome {
        let mut outcome = RecordOutcome {
            outbox_id: None,
            published: false,
            dead_letter_reason: None,
        };

        match NewOutboxRecord::from_event(event) {
            Ok(record) => match self.store.save(record).await {
                Ok(id) => outcome.outbox_id = Some(id),
                Err(e) => tracing::error!(
                    event_id = %event.event_id(),
                    event_type = %event.event_type(),
                    error = %e,
                    "Failed to save event to outbox"
                ),
            },
            Err(e) => tracing::error!(
                event_id = %event.event_id(),
                event_type = %event.event_type(),
                error = %e,
                "Failed to serialize event for outbox"
            ),
        }

        let envelope = match EventEnvelope::from_event(event) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(event_id = %event.event_id(), error = %e, "Failed to build envelope");
                return outcome;
            },
        };

        match self.publisher.publish(&envelope).await {
            Ok(()) => {
                outcome.published = true;
                if let Some(id) = outcome.outbox_id {
                    if let Err(e) = self.store.mark_as_published(id).await {
                        // The processor will publish it again; consumers are idempotent.
                        tracing::warn!(
                            record_id = %id,
                            error = %e,
                            "Directly published event could not be marked as published"
                        );
                    }
                }
            },
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    error = %reason,
                    "Direct publish failed, forwarding to dead-letter topic"
                );
                self.publisher.publish_to_dlq(&envelope, &reason).await;
                outcome.dead_letter_reason = Some(reason);
            },
        }

        outcome
    }
}

impl std::fmt::Debug for EventRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRecorder")
            .field("publisher", &self.publisher)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use chrono::Utc;
    use ledger_events_core::account::AccountCreated;
    use ledger_events_core::broker::{BrokerError, HEADER_ERROR};
    use ledger_events_core::outbox::OutboxStatus;
    use ledger_events_testing::{InMemoryBroker, InMemoryOutboxStore};

    const TOPIC: &str = "account-events";
    const DLQ: &str = "account-events-dlq";

    fn recorder(store: &InMemoryOutboxStore, broker: &InMemoryBroker) -> EventRecorder {
        let publisher = EventPublisher::new(Arc::new(broker.clone()), TOPIC);
        EventRecorder::new(Arc::new(store.clone()), Arc::new(publisher))
    }

    fn created() -> AccountCreated {
        AccountCreated::new("acct-1", "Ada", "ada@example.com", Utc::now())
    }

    #[tokio::test]
    async fn direct_publish_marks_outbox_record() {
        let (store, broker) = (InMemoryOutboxStore::new(), InMemoryBroker::new());

        let outcome = recorder(&store, &broker).record(&created()).await;

        let id = outcome.outbox_id.unwrap();
        assert!(outcome.published);
        assert_eq!(store.get(id).unwrap().status, OutboxStatus::Published);
        assert_eq!(broker.messages(TOPIC).len(), 1);
    }

    #[tokio::test]
    async fn direct_failure_goes_to_dlq_and_stays_pending() {
        let (store, broker) = (InMemoryOutboxStore::new(), InMemoryBroker::new());
        broker.fail_next_send(TOPIC, BrokerError::Unavailable("publish error".into()));

        let outcome = recorder(&store, &broker).record(&created()).await;

        assert!(!outcome.published);
        assert!(outcome.dead_letter_reason.unwrap().contains("publish error"));
        let id = outcome.outbox_id.unwrap();
        assert_eq!(store.get(id).unwrap().status, OutboxStatus::Pending);
        let dead = broker.messages(DLQ);
        assert_eq!(dead.len(), 1);
        assert!(dead[0].header(HEADER_ERROR).unwrap().contains("publish error"));
    }

    #[tokio::test]
    async fn publish_and_dlq_failure_do_not_fail_the_caller() {
        let (store, broker) = (InMemoryOutboxStore::new(), InMemoryBroker::new());
        broker.fail_sends(TOPIC, BrokerError::Unavailable("publish error".into()));
        broker.fail_sends(DLQ, BrokerError::Unavailable("dlq error".into()));

        let outcome = recorder(&store, &broker).record(&created()).await;

        assert!(outcome.is_durable());
        assert!(!outcome.published);
        assert!(broker.messages(DLQ).is_empty());
    }

    #[tokio::test]
    async fn outbox_failure_still_publishes() {
        let (store, broker) = (InMemoryOutboxStore::new(), InMemoryBroker::new());
        store.fail_saves("connection refused");

        let outcome = recorder(&store, &broker).record(&created()).await;

        assert!(!outcome.is_durable());
        assert!(outcome.published);
        assert!(store.is_empty());
    }
}
