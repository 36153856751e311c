//! Prometheus metrics for the delivery pipeline.
//!
//! Components record through the `metrics` facade; nothing is exported until a
//! process installs the exporter with [`MetricsServer::start`].
//!
//! # Example
//!
//! ```rust,no_run
//! use ledger_events_runtime::metrics::MetricsServer;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus scrape endpoint.
#[derive(Debug, Clone, Copy)]
pub struct MetricsServer {
    addr: SocketAddr,
}

impl MetricsServer {
    /// Create a server that will listen on `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Address the exporter listens on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Install the global recorder and start the HTTP listener.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Build`] for an invalid exporter configuration and
    /// [`MetricsError::Install`] if a recorder is already installed or the
    /// listener cannot start.
    pub fn start(&self) -> Result<(), MetricsError> {
        describe_metrics();

        PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .install()
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        tracing::info!(addr = %self.addr, "Metrics exporter listening");
        Ok(())
    }
}

/// Register descriptions for every metric the pipeline emits.
pub fn describe_metrics() {
    // Outbox store
    describe_counter!("outbox_events_saved_total", "Events written to the outbox");
    describe_counter!(
        "outbox_store_errors_total",
        "Outbox store operations that failed"
    );

    // Outbox processor
    describe_counter!(
        "outbox_published_total",
        "Outbox records published to the primary topic"
    );
    describe_counter!(
        "outbox_dead_lettered_total",
        "Exhausted outbox records forwarded to the dead-letter topic"
    );
    describe_counter!(
        "outbox_failed_total",
        "Outbox records charged a retry after a non-infrastructure failure"
    );
    describe_counter!(
        "outbox_deferred_total",
        "Outbox records left pending after an infrastructure failure"
    );
    describe_counter!(
        "outbox_skipped_total",
        "Outbox records with an unregistered event type"
    );
    describe_counter!(
        "outbox_batch_errors_total",
        "Processor sweeps whose batch fetch failed"
    );

    // Publisher
    describe_counter!(
        "publisher_messages_sent_total",
        "Messages acknowledged by the broker"
    );
    describe_counter!(
        "publisher_send_errors_total",
        "Broker sends that failed or timed out"
    );
    describe_histogram!(
        "publisher_send_duration_seconds",
        "Time from send to broker acknowledgment"
    );

    // Consumer
    describe_counter!(
        "consumer_messages_handled_total",
        "Messages processed successfully by a handler"
    );
    describe_counter!(
        "consumer_handler_errors_total",
        "Handler invocations that failed and were redelivered"
    );
    describe_counter!(
        "consumer_poison_messages_total",
        "Messages skipped because their event type could not be determined"
    );
    describe_counter!(
        "consumer_fetch_errors_total",
        "Failed fetches from the broker"
    );
}
