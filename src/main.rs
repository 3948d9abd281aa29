use clap::Parser;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

use modelhub_gateway::config::Config;
use modelhub_gateway::endpoints::status::GATEWAY_VERSION;
use modelhub_gateway::gateway_util::AppStateData;
use modelhub_gateway::observability;
use modelhub_gateway::routes;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the gateway config file
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Start with default settings instead of a config file
    #[arg(long)]
    default_config: bool,

    /// Override the configured bind address
    #[arg(long)]
    bind_address: Option<SocketAddr>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Set up logs first so everything below can use `tracing`
    observability::setup_logs();

    tracing::info!("Starting ModelHub Gateway {GATEWAY_VERSION}");

    if args.config_file.is_some() && args.default_config {
        tracing::error!("Cannot specify both `--config-file` and `--default-config`");
        std::process::exit(1);
    }

    let config = match &args.config_file {
        Some(path) => Arc::new(Config::load(path).expect_pretty("Failed to load config")),
        None => {
            if !args.default_config {
                tracing::warn!(
                    "No `--config-file` provided; starting with default settings. Use `--default-config` to silence this warning."
                );
            }
            Arc::new(Config::default())
        }
    };

    observability::setup_metrics(&config).expect_pretty("Failed to set up metrics");

    let app_state = AppStateData::new(config.clone())
        .await
        .expect_pretty("Failed to initialize AppState");

    let router = routes::build_router(app_state.clone());

    // Bind to the CLI override, the configured address, or 0.0.0.0:3000
    let bind_address = args
        .bind_address
        .or(config.gateway.bind_address)
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .expect_pretty(&format!("Failed to bind to socket address {bind_address}"));
    let actual_bind_address = listener
        .local_addr()
        .expect_pretty("Failed to get bind address from listener");

    tracing::info!("ModelHub Gateway is listening on {actual_bind_address}");
    match &config.stores.instances {
        Some(path) => tracing::info!("├ Instance store: {}", path.display()),
        None => tracing::info!("├ Instance store: none"),
    }
    match &config.stores.settings {
        Some(path) => tracing::info!("├ Settings store: {}", path.display()),
        None => tracing::info!("├ Settings store: none (settings are not persisted)"),
    }
    tracing::info!("└ Idempotency: {:?}", config.idempotency.mode);

    // Start the server
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect_pretty("Failed to start server");

    // Stop admissions and dispose every connection pool before exiting
    app_state.router.shutdown().await;
    tracing::info!("ModelHub Gateway shut down");
}

/// Resolve once the process is asked to stop: Ctrl+C everywhere, SIGTERM
/// additionally on unix (what container runtimes send).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect_pretty("Failed to install SIGTERM handler");
        tokio::select! {
            result = signal::ctrl_c() => {
                result.expect_pretty("Failed to listen for Ctrl+C");
                tracing::info!("Received Ctrl+C signal");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM signal");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .expect_pretty("Failed to listen for Ctrl+C");
        tracing::info!("Received Ctrl+C signal");
    }
}

/// Startup-only escape hatch. Once the server is up, every failure flows
/// through `Error`; while wiring up config, sockets, and app state there is
/// no caller to return to, so `expect_pretty` logs the problem and exits 1
/// instead of panicking with a backtrace. Nothing outside main.rs uses it.
trait ExpectPretty<T> {
    fn expect_pretty(self, msg: &str) -> T;
}

impl<T, E: Display> ExpectPretty<T> for Result<T, E> {
    fn expect_pretty(self, msg: &str) -> T {
        self.unwrap_or_else(|err| {
            tracing::error!("{msg}: {err}");
            std::process::exit(1);
        })
    }
}

impl<T> ExpectPretty<T> for Option<T> {
    fn expect_pretty(self, msg: &str) -> T {
        self.unwrap_or_else(|| {
            tracing::error!("{msg}");
            std::process::exit(1);
        })
    }
}
