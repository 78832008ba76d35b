//! nzbmux -- aggregating proxy for Newznab indexers.
//!
//! Entry point wiring:
//!   - Configuration loading (YAML)
//!   - Store initialization + schema migration
//!   - Proxy construction (one upstream client per backend)
//!   - RSS poller fleet
//!   - HTTP server with graceful shutdown on SIGTERM / SIGINT

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use nzbmux::AppState;
use nzbmux::config::{CONFIG_PATH_ENV_VAR, Config};
use nzbmux::newznab::server;
use nzbmux::proxy::Proxy;
use nzbmux::proxy::poller::{PollerFleet, StopOutcome};
use nzbmux::store::Store;

// ---------------------------------------------------------------------------
// CLI argument parsing (minimal, no clap dependency)
// ---------------------------------------------------------------------------

struct CliArgs {
    config_path: Option<PathBuf>,
}

fn parse_args() -> CliArgs {
    let mut args = std::env::args().skip(1);
    let mut config_path = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                if let Some(path) = args.next() {
                    config_path = Some(PathBuf::from(path));
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("nzbmux {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                eprintln!("Run with --help for usage information.");
                std::process::exit(1);
            }
        }
    }

    CliArgs { config_path }
}

fn print_usage() {
    println!(
        "\
nzbmux {version} -- aggregating Newznab proxy

USAGE:
    nzbmux [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Path to configuration file [default: .my.config.yaml]
    -h, --help             Print this help message
    -V, --version          Print version information

ENVIRONMENT:
    RUST_LOG                    Override log level (e.g. RUST_LOG=debug)
    {env_var}    Alternative to --config flag
",
        version = env!("CARGO_PKG_VERSION"),
        env_var = CONFIG_PATH_ENV_VAR,
    );
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = parse_args();
    let config_path = cli.config_path.unwrap_or_else(Config::default_path);

    let config = Config::load(&config_path)?;
    init_tracing(&config);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        backends = config.backends.len(),
        "Starting nzbmux"
    );

    // Opening the store runs the embedded migrations; a diverged history
    // aborts startup here.
    let store = Store::open(&config.storage.db_path)?;
    tracing::info!(path = %config.storage.db_path.display(), "Store opened");

    let config = Arc::new(config);
    let proxy = Arc::new(Proxy::new(config.clone(), store));

    let mut fleet = PollerFleet::from_proxy(&proxy);
    tracing::info!(workers = fleet.worker_count(), "Starting RSS poller fleet");
    fleet.start();

    let state = AppState::new(config.clone(), proxy);
    let app = server::build_router(state);

    let listen_addr = config.listen_addr();
    let listener = TcpListener::bind(&listen_addr).await?;
    tracing::info!(addr = %listen_addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down");
    if fleet.stop().await == StopOutcome::ForcedCancel {
        tracing::warn!("RSS pollers were force-cancelled during shutdown");
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tracing initialization
// ---------------------------------------------------------------------------

/// Set up the tracing subscriber based on configuration.
fn init_tracing(config: &Config) {
    // RUST_LOG env var takes precedence over config file
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &config.logging.level;
        // Set nzbmux to the configured level, dependencies to warn
        EnvFilter::new(format!("nzbmux={level},tower_http={level},warn"))
    });

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if config.logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

/// Wait for a shutdown signal (SIGTERM or SIGINT / Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C)");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
