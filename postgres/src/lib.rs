//! `PostgreSQL` outbox store for ledger event delivery.
//!
//! Implements the `OutboxStore` trait from `ledger-events-core` on top of a sqlx
//! connection pool:
//!
//! - Outbox inserts, standalone or inside the caller's business transaction
//! - Bounded, oldest-first fetch of pending and retryable records
//! - Atomic single-row status transitions
//! - Idempotent schema setup
//!
//! # Example
//!
//! ```no_run
//! use ledger_events_core::account::AccountCreated;
//! use ledger_events_core::outbox::{NewOutboxRecord, OutboxStore};
//! use ledger_events_postgres::{PostgresOutboxStore, run_migrations};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PostgresOutboxStore::connect("postgres://localhost/ledger", 10).await?;
//! run_migrations(store.pool()).await?;
//!
//! let event = AccountCreated::new("acct-1", "Ada", "ada@example.com", chrono::Utc::now());
//! let id = store.save(NewOutboxRecord::from_event(&event)?).await?;
//! println!("queued {id}");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod outbox_store;
mod schema;

pub use outbox_store::PostgresOutboxStore;
pub use schema::run_migrations;
