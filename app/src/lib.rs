//! # Ledger Events App
//!
//! Process wiring for the two long-running services of the ledger event
//! pipeline:
//!
//! - `outbox-relay`: runs the outbox processor against Postgres and Redpanda
//! - `event-worker`: consumes the account topic and runs the account handlers
//!
//! Both read their settings from the environment (see [`config::Config`]) and
//! stop cleanly on Ctrl+C or SIGTERM.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod handlers;
pub mod shutdown;
pub mod telemetry;

pub use config::{Config, ConfigError};
