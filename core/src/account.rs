//! Ledger account events.
//!
//! These are the events the account aggregate emits. The aggregate's business
//! rules live elsewhere; this module only defines the event payloads and their
//! discriminators so the outbox, the publisher and the consumers agree on them.
//!
//! Every event embeds an [`EventMeta`] header, flattened into the JSON payload:
//!
//! ```json
//! {
//!   "id": "1f0e...",
//!   "account_id": "acct-1",
//!   "event_type": "AccountDeposited",
//!   "timestamp": "2025-01-01T00:00:00Z",
//!   "aggregate_id": "acct-1",
//!   "amount": 250.0,
//!   "current_balance": 1250.0
//! }
//! ```

use crate::event::DomainEvent;
use crate::registry::{EventTypeRegistry, RegistryError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fields shared by every account event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    /// Event occurrence id.
    pub id: Uuid,
    /// Account the event belongs to.
    pub account_id: String,
    /// Discriminator, duplicated into the payload for header-less consumers.
    pub event_type: String,
    /// Domain occurrence time.
    pub timestamp: DateTime<Utc>,
    /// Aggregate id (the account id for account events).
    pub aggregate_id: String,
}

impl EventMeta {
    /// Build the header for a new event on `account_id`, stamped at `timestamp`.
    #[must_use]
    pub fn new(event_type: &str, account_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        let account_id = account_id.into();
        Self {
            id: Uuid::new_v4(),
            aggregate_id: account_id.clone(),
            account_id,
            event_type: event_type.to_string(),
            timestamp,
        }
    }
}

macro_rules! account_event {
    ($ty:ident, $name:literal) => {
        impl DomainEvent for $ty {
            const EVENT_TYPE: &'static str = $name;

            fn event_id(&self) -> Uuid {
                self.meta.id
            }

            fn aggregate_id(&self) -> &str {
                &self.meta.aggregate_id
            }

            fn occurred_at(&self) -> DateTime<Utc> {
                self.meta.timestamp
            }
        }
    };
}

/// An account was opened.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountCreated {
    /// Common header.
    #[serde(flatten)]
    pub meta: EventMeta,
    /// Holder name.
    pub name: String,
    /// Holder email.
    pub email: String,
}

impl AccountCreated {
    /// Create the event for a freshly opened account.
    #[must_use]
    pub fn new(
        account_id: impl Into<String>,
        name: impl Into<String>,
        email: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            meta: EventMeta::new(Self::EVENT_TYPE, account_id, timestamp),
            name: name.into(),
            email: email.into(),
        }
    }
}

account_event!(AccountCreated, "AccountCreated");

/// Money was deposited into an account.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountDeposited {
    /// Common header.
    #[serde(flatten)]
    pub meta: EventMeta,
    /// Deposited amount.
    pub amount: f64,
    /// Balance after the deposit.
    pub current_balance: f64,
}

impl AccountDeposited {
    /// Create a deposit event.
    #[must_use]
    pub fn new(
        account_id: impl Into<String>,
        amount: f64,
        current_balance: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            meta: EventMeta::new(Self::EVENT_TYPE, account_id, timestamp),
            amount,
            current_balance,
        }
    }
}

account_event!(AccountDeposited, "AccountDeposited");

/// Money was withdrawn from an account.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountWithdrawn {
    /// Common header.
    #[serde(flatten)]
    pub meta: EventMeta,
    /// Withdrawn amount.
    pub amount: f64,
    /// Balance after the withdrawal.
    pub current_balance: f64,
}

impl AccountWithdrawn {
    /// Create a withdrawal event.
    #[must_use]
    pub fn new(
        account_id: impl Into<String>,
        amount: f64,
        current_balance: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            meta: EventMeta::new(Self::EVENT_TYPE, account_id, timestamp),
            amount,
            current_balance,
        }
    }
}

account_event!(AccountWithdrawn, "AccountWithdrawn");

/// An account was blocked.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountBlocked {
    /// Common header.
    #[serde(flatten)]
    pub meta: EventMeta,
    /// Why the account was blocked.
    pub reason: String,
}

account_event!(AccountBlocked, "AccountBlocked");

/// A blocked account was activated again.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountActivated {
    /// Common header.
    #[serde(flatten)]
    pub meta: EventMeta,
}

account_event!(AccountActivated, "AccountActivated");

/// Registry with a decoder for every account event.
///
/// # Errors
///
/// Only fails if two account events share a discriminator, which would be a
/// programming error caught by the unit tests below.
pub fn account_registry() -> Result<EventTypeRegistry, RegistryError> {
    let mut registry = EventTypeRegistry::new();
    registry.register::<AccountCreated>()?;
    registry.register::<AccountDeposited>()?;
    registry.register::<AccountWithdrawn>()?;
    registry.register::<AccountBlocked>()?;
    registry.register::<AccountActivated>()?;
    Ok(registry)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn payload_is_flat_json() {
        let event = AccountDeposited::new("acct-1", 250.0, 1250.0, Utc::now());
        let payload = event.to_payload().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();

        assert_eq!(json["event_type"], "AccountDeposited");
        assert_eq!(json["aggregate_id"], "acct-1");
        assert_eq!(json["account_id"], "acct-1");
        assert_eq!(json["amount"], 250.0);
        assert!(json.get("meta").is_none());
    }

    #[test]
    fn meta_drives_envelope_identity() {
        let event = AccountCreated::new("acct-7", "Ada", "ada@example.com", Utc::now());

        assert_eq!(event.event_type(), "AccountCreated");
        assert_eq!(event.aggregate_id(), "acct-7");
        assert_eq!(event.event_id(), event.meta.id);
        assert_eq!(event.occurred_at(), event.meta.timestamp);
    }

    #[test]
    fn account_registry_knows_every_account_event() {
        let registry = account_registry().expect("account events have unique names");

        for name in [
            "AccountCreated",
            "AccountDeposited",
            "AccountWithdrawn",
            "AccountBlocked",
            "AccountActivated",
        ] {
            assert!(registry.contains(name), "missing {name}");
        }
        assert_eq!(registry.len(), 5);
    }
}
