//! Event worker
//!
//! Consumes the account topic as part of the worker consumer group and runs
//! the account handlers. Positions are committed only after a handler succeeds.
//!
//! # Usage
//!
//! ```bash
//! REDPANDA_BROKERS=localhost:9092 cargo run --bin event-worker
//! ```

use ledger_events_app::handlers::account_handlers;
use ledger_events_app::{Config, shutdown, telemetry};
use ledger_events_core::account::account_registry;
use ledger_events_redpanda::RedpandaSource;
use ledger_events_runtime::EventConsumer;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let config = Config::from_env()?;
    telemetry::init_tracing(config.telemetry.log_format);
    telemetry::init_metrics(&config.telemetry)?;

    tracing::info!(
        brokers = %config.redpanda.brokers,
        topic = %config.redpanda.topic,
        group_id = %config.redpanda.consumer_group,
        "Starting event worker"
    );

    let source = RedpandaSource::builder()
        .brokers(config.redpanda.brokers.as_str())
        .group_id(config.redpanda.consumer_group.as_str())
        .topic(config.redpanda.topic.as_str())
        .build()?;

    let registry = account_registry()?;
    let mut consumer = EventConsumer::new(Arc::new(source)).with_known_types(&registry);
    for handler in account_handlers() {
        consumer.register_handler(handler)?;
    }

    consumer.start(shutdown::shutdown_token()).await?;

    tracing::info!("Event worker stopped");
    Ok(())
}
