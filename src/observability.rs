use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::error::Error;

/// Filter applied when `RUST_LOG` is unset: gateway modules at debug,
/// everything else at warn.
const DEFAULT_LOG_FILTER: &str = "gateway=debug,modelhub_gateway=debug,warn";

const DEFAULT_PROMETHEUS_PORT: u16 = 9090;

/// Install the global JSON log subscriber. Must run before anything else
/// emits a `tracing` event, so `main` calls it first.
pub fn setup_logs() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .flatten_event(true)
        .with_current_span(false)
        .with_target(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .init();
}

/// Start the Prometheus scrape listener for the `metrics` counters recorded
/// on the request path. The address comes from `[gateway].prometheus_address`
/// in the config file, falling back to 0.0.0.0:9090.
pub fn setup_metrics(config: &Config) -> Result<(), Error> {
    let listen_addr = config
        .gateway
        .prometheus_address
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], DEFAULT_PROMETHEUS_PORT)));

    PrometheusBuilder::new()
        .with_http_listener(listen_addr)
        .install()
        .map_err(|e| Error::Observability {
            message: format!("Failed to install Prometheus exporter on {listen_addr}: {e}"),
        })
}
