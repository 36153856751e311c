//! Tracing and metrics bootstrap shared by the binaries.

use crate::config::{LogFormat, TelemetryConfig};
use ledger_events_runtime::metrics::{MetricsError, MetricsServer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "info,ledger_events=info,sqlx=warn,rdkafka=warn";

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides [`DEFAULT_LOG_FILTER`]. A subscriber that is already
/// installed is left in place.
pub fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Pretty => registry.with(fmt::layer()).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

/// Start the Prometheus exporter if an address is configured.
///
/// Returns whether an exporter was started.
///
/// # Errors
///
/// Returns a [`MetricsError`] if the exporter cannot be installed.
pub fn init_metrics(config: &TelemetryConfig) -> Result<bool, MetricsError> {
    match config.metrics_addr {
        Some(addr) => {
            MetricsServer::new(addr).start()?;
            Ok(true)
        },
        None => {
            tracing::info!("METRICS_ADDR not set, metrics exporter disabled");
            Ok(false)
        },
    }
}
