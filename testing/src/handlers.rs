//! Recording consumer handler.

use async_trait::async_trait;
use ledger_events_core::handler::{EventHandler, HandlerContext, HandlerError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// One invocation seen by a [`RecordingHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedDelivery {
    /// Offset of the delivered message.
    pub offset: i64,
    /// Partition key of the delivered message.
    pub key: Option<String>,
    /// Raw payload.
    pub payload: Vec<u8>,
    /// Whether the handler reported success for this invocation.
    pub succeeded: bool,
}

/// Handler that records every invocation and optionally fails the first N.
///
/// Clones share the recorded deliveries.
#[derive(Debug, Clone)]
pub struct RecordingHandler {
    event_type: String,
    deliveries: Arc<Mutex<Vec<RecordedDelivery>>>,
    failures_left: Arc<AtomicUsize>,
}

impl RecordingHandler {
    /// A handler for `event_type` that always succeeds.
    #[must_use]
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            deliveries: Arc::new(Mutex::new(Vec::new())),
            failures_left: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fail the next `times` invocations before succeeding.
    #[must_use]
    pub fn failing_times(self, times: usize) -> Self {
        self.failures_left.store(times, Ordering::SeqCst);
        self
    }

    /// Every invocation so far.
    #[must_use]
    pub fn deliveries(&self) -> Vec<RecordedDelivery> {
        self.deliveries.lock().unwrap().clone()
    }

    /// Number of invocations so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }

    /// Number of successful invocations so far.
    #[must_use]
    pub fn successes(&self) -> usize {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .filter(|delivery| delivery.succeeded)
            .count()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    fn event_type(&self) -> &str {
        &self.event_type
    }

    async fn handle(&self, ctx: &HandlerContext, payload: &[u8]) -> Result<(), HandlerError> {
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();

        self.deliveries.lock().unwrap().push(RecordedDelivery {
            offset: ctx.offset,
            key: ctx.key.clone(),
            payload: payload.to_vec(),
            succeeded: !fail,
        });

        if fail {
            return Err(HandlerError::failed("scripted failure"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> HandlerContext {
        HandlerContext {
            event_type: "AccountCreated".into(),
            topic: "account-events".into(),
            partition: 0,
            offset: 3,
            key: Some("acct-1".into()),
            cancellation: Default::default(),
        }
    }

    #[tokio::test]
    async fn fails_scripted_number_of_times() {
        let handler = RecordingHandler::new("AccountCreated").failing_times(2);
        let ctx = context();

        assert!(handler.handle(&ctx, b"{}").await.is_err());
        assert!(handler.handle(&ctx, b"{}").await.is_err());
        assert!(handler.handle(&ctx, b"{}").await.is_ok());

        assert_eq!(handler.calls(), 3);
        assert_eq!(handler.successes(), 1);
        assert_eq!(handler.deliveries()[0].offset, 3);
    }
}
