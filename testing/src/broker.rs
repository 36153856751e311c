//! In-memory broker: a per-topic message log with scripted failures.

use ledger_events_core::broker::{
    BrokerError, BrokerFuture, BrokerMessage, InboundMessage, MessageSink, MessageSource,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Default)]
struct BrokerState {
    logs: HashMap<String, Vec<BrokerMessage>>,
    one_shot_failures: HashMap<String, VecDeque<BrokerError>>,
    sticky_failures: HashMap<String, BrokerError>,
    send_attempts: HashMap<String, usize>,
    created_topics: Vec<String>,
    topic_creation_failure: Option<BrokerError>,
}

/// In-memory broker implementing [`MessageSink`].
///
/// Sent messages are appended to a per-topic log. Failures can be scripted per
/// topic, either for the next N sends ([`fail_next_send`](Self::fail_next_send))
/// or until healed ([`fail_sends`](Self::fail_sends)). Readers are created with
/// [`source`](Self::source). Clones share the same logs.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    appended: Arc<Notify>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages accepted on `topic`, in send order.
    #[must_use]
    pub fn messages(&self, topic: &str) -> Vec<BrokerMessage> {
        self.state
            .lock()
            .unwrap()
            .logs
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of send attempts on `topic`, including failed ones.
    #[must_use]
    pub fn send_attempts(&self, topic: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .send_attempts
            .get(topic)
            .copied()
            .unwrap_or(0)
    }

    /// Fail the next send to `topic` with `error`. Calls queue up.
    pub fn fail_next_send(&self, topic: &str, error: BrokerError) {
        self.state
            .lock()
            .unwrap()
            .one_shot_failures
            .entry(topic.to_string())
            .or_default()
            .push_back(error);
    }

    /// Fail every send to `topic` with `error` until [`heal`](Self::heal).
    pub fn fail_sends(&self, topic: &str, error: BrokerError) {
        self.state
            .lock()
            .unwrap()
            .sticky_failures
            .insert(topic.to_string(), error);
    }

    /// Remove every scripted failure for `topic`.
    pub fn heal(&self, topic: &str) {
        let mut state = self.state.lock().unwrap();
        state.one_shot_failures.remove(topic);
        state.sticky_failures.remove(topic);
    }

    /// Make [`MessageSink::ensure_topics`] fail with `error`.
    pub fn fail_topic_creation(&self, error: BrokerError) {
        self.state.lock().unwrap().topic_creation_failure = Some(error);
    }

    /// Topics created through [`MessageSink::ensure_topics`], without duplicates.
    #[must_use]
    pub fn created_topics(&self) -> Vec<String> {
        self.state.lock().unwrap().created_topics.clone()
    }

    /// Append a message to its topic bypassing scripted failures.
    ///
    /// Lets consumer tests inject messages with arbitrary headers, such as
    /// messages missing the `event_type` header.
    pub fn append(&self, message: BrokerMessage) {
        self.state
            .lock()
            .unwrap()
            .logs
            .entry(message.topic.clone())
            .or_default()
            .push(message);
        self.appended.notify_waiters();
    }

    /// A reader for `topic` starting at the first message.
    #[must_use]
    pub fn source(&self, topic: &str) -> InMemorySource {
        InMemorySource {
            broker: self.clone(),
            topic: topic.to_string(),
            state: Arc::new(Mutex::new(SourceState::default())),
        }
    }

    fn message_at(&self, topic: &str, index: usize) -> Option<BrokerMessage> {
        self.state
            .lock()
            .unwrap()
            .logs
            .get(topic)
            .and_then(|log| log.get(index))
            .cloned()
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        let mut topics: Vec<_> = state.logs.keys().cloned().collect();
        topics.sort();
        f.debug_struct("InMemoryBroker")
            .field("topics", &topics)
            .finish_non_exhaustive()
    }
}

impl MessageSink for InMemoryBroker {
    fn send(&self, message: BrokerMessage) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            {
                let mut state = self.state.lock().unwrap();
                *state
                    .send_attempts
                    .entry(message.topic.clone())
                    .or_insert(0) += 1;

                if let Some(error) = state
                    .one_shot_failures
                    .get_mut(&message.topic)
                    .and_then(VecDeque::pop_front)
                {
                    return Err(error);
                }
                if let Some(error) = state.sticky_failures.get(&message.topic) {
                    return Err(error.clone());
                }
            }
            self.append(message);
            Ok(())
        })
    }

    fn ensure_topics(&self, topics: &[String]) -> BrokerFuture<'_, ()> {
        let topics = topics.to_vec();
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            if let Some(error) = &state.topic_creation_failure {
                return Err(error.clone());
            }
            for topic in topics {
                if !state.created_topics.contains(&topic) {
                    state.created_topics.push(topic);
                }
            }
            Ok(())
        })
    }
}

#[derive(Default)]
struct SourceState {
    position: usize,
    committed: Vec<i64>,
    redelivered: Vec<i64>,
    fetch_failures: VecDeque<BrokerError>,
    commit_failures: VecDeque<BrokerError>,
    redeliver_failures: VecDeque<BrokerError>,
    closed: bool,
}

/// Reader over one topic of an [`InMemoryBroker`], implementing [`MessageSource`].
///
/// Offsets are positions in the topic log, all on partition 0. `fetch` waits for
/// new messages when the reader is caught up. Clones share the read position.
#[derive(Clone)]
pub struct InMemorySource {
    broker: InMemoryBroker,
    topic: String,
    state: Arc<Mutex<SourceState>>,
}

impl InMemorySource {
    /// Offsets committed so far, in commit order.
    #[must_use]
    pub fn committed(&self) -> Vec<i64> {
        self.state.lock().unwrap().committed.clone()
    }

    /// Offsets handed back through [`MessageSource::redeliver`], in call order.
    #[must_use]
    pub fn redelivered(&self) -> Vec<i64> {
        self.state.lock().unwrap().redelivered.clone()
    }

    /// Whether [`MessageSource::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Fail the next fetch with `error`. Calls queue up.
    pub fn fail_next_fetch(&self, error: BrokerError) {
        self.state.lock().unwrap().fetch_failures.push_back(error);
    }

    /// Fail the next commit with `error`. Calls queue up.
    pub fn fail_next_commit(&self, error: BrokerError) {
        self.state.lock().unwrap().commit_failures.push_back(error);
    }

    /// Fail the next rewind with `error`, leaving the read position untouched.
    /// Calls queue up.
    pub fn fail_next_redeliver(&self, error: BrokerError) {
        self.state.lock().unwrap().redeliver_failures.push_back(error);
    }

    fn try_next(&self) -> Result<Option<InboundMessage>, BrokerError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(BrokerError::Closed);
        }
        if let Some(error) = state.fetch_failures.pop_front() {
            return Err(error);
        }

        let Some(message) = self.broker.message_at(&self.topic, state.position) else {
            return Ok(None);
        };
        let offset = i64::try_from(state.position).unwrap_or(i64::MAX);
        state.position += 1;

        Ok(Some(InboundMessage {
            topic: message.topic,
            partition: 0,
            offset,
            key: (!message.key.is_empty()).then_some(message.key),
            payload: message.payload,
            headers: message.headers,
            timestamp: Some(message.timestamp),
        }))
    }
}

impl std::fmt::Debug for InMemorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySource")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl MessageSource for InMemorySource {
    fn fetch(&self) -> BrokerFuture<'_, InboundMessage> {
        Box::pin(async move {
            loop {
                let appended = self.broker.appended.notified();
                tokio::pin!(appended);
                // Register interest before checking so an append in between is not missed.
                appended.as_mut().enable();

                if let Some(message) = self.try_next()? {
                    return Ok(message);
                }
                appended.await;
            }
        })
    }

    fn commit<'a>(&'a self, message: &'a InboundMessage) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            if let Some(error) = state.commit_failures.pop_front() {
                return Err(error);
            }
            state.committed.push(message.offset);
            Ok(())
        })
    }

    fn redeliver<'a>(&'a self, message: &'a InboundMessage) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            if let Some(error) = state.redeliver_failures.pop_front() {
                return Err(error);
            }
            state.position = usize::try_from(message.offset).unwrap_or(0);
            state.redelivered.push(message.offset);
            Ok(())
        })
    }

    fn close(&self) -> Result<(), BrokerError> {
        self.state.lock().unwrap().closed = true;
        self.broker.appended.notify_waiters();
        Ok(())
    }
}
