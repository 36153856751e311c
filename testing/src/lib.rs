//! # Ledger Events Testing
//!
//! Test doubles for the reliable event delivery stack.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - [`InMemoryOutboxStore`]: outbox store with failure injection
//! - [`InMemoryBroker`]: broker log implementing the sink, with per-topic
//!   scripted send failures and [`InMemorySource`] readers
//! - [`RecordingHandler`]: consumer handler that records deliveries and can
//!   be told to fail
//! - proptest strategies for outbox inputs
//!
//! ## Example
//!
//! ```
//! use ledger_events_core::broker::{BrokerError, BrokerMessage, MessageSink};
//! use ledger_events_testing::InMemoryBroker;
//! use chrono::Utc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let broker = InMemoryBroker::new();
//! broker.fail_next_send("account-events", BrokerError::Unavailable("down".into()));
//!
//! let message = BrokerMessage {
//!     topic: "account-events".into(),
//!     key: "acct-1".into(),
//!     payload: b"{}".to_vec(),
//!     headers: vec![],
//!     timestamp: Utc::now(),
//! };
//! assert!(broker.send(message.clone()).await.is_err());
//! assert!(broker.send(message).await.is_ok());
//! assert_eq!(broker.messages("account-events").len(), 1);
//! # }
//! ```

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Locks only panic if a test already panicked

use chrono::{DateTime, Utc};
use ledger_events_core::clock::Clock;

mod broker;
mod handlers;
mod outbox_store;

pub use broker::{InMemoryBroker, InMemorySource};
pub use handlers::{RecordedDelivery, RecordingHandler};
pub use outbox_store::InMemoryOutboxStore;

/// Deterministic clocks.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use chrono::Duration;
    use std::sync::{Arc, Mutex};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use ledger_events_testing::mocks::FixedClock;
    /// use ledger_events_core::clock::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when a test advances it.
    ///
    /// Clones share the same time.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Start the clock at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward by `by`.
        pub fn advance(&self, by: Duration) {
            let mut time = self.time.lock().unwrap();
            *time += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(epoch())
    }

    /// A manual clock starting at 2025-01-01 00:00:00 UTC.
    #[must_use]
    pub fn manual_clock() -> ManualClock {
        ManualClock::new(epoch())
    }

    fn epoch() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }
}

/// Test helpers.
pub mod helpers {
    /// Install a test-friendly tracing subscriber once per process.
    ///
    /// Honors `RUST_LOG`; output goes through the test harness capture.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "ledger_events=debug".into()),
            )
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing strategies using proptest.
pub mod properties {
    use proptest::prelude::*;

    /// Event type discriminators: a non-empty identifier without whitespace.
    pub fn event_type() -> impl Strategy<Value = String> {
        "[A-Z][A-Za-z]{2,20}"
    }

    /// Aggregate ids of the `acct-<n>` shape.
    pub fn aggregate_id() -> impl Strategy<Value = String> {
        (1u32..50).prop_map(|n| format!("acct-{n}"))
    }

    /// Arbitrary JSON-ish payload bytes.
    pub fn payload() -> impl Strategy<Value = Vec<u8>> {
        "[a-z0-9]{0,32}".prop_map(|body| format!("{{\"body\":\"{body}\"}}").into_bytes())
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, ManualClock, manual_clock, test_clock};
