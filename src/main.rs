//! Chunkyard -- resumable chunked-upload server.
//!
//! Crash-only design: every startup is a recovery. Partially written
//! uploads are reconciled lazily on their next read, and the first reaper
//! sweep runs at startup. SIGTERM/SIGINT only stop accepting connections
//! and wait with a timeout before exiting -- no cleanup.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use chunkyard::config::Config;
use chunkyard::engine::UploadEngine;
use chunkyard::hooks::DefaultHooks;
use chunkyard::metadata::store::MetadataStore;
use chunkyard::reaper::ExpiryReaper;
use chunkyard::storage::local::LocalDatastore;

/// Command-line arguments for the Chunkyard server.
#[derive(Parser, Debug)]
#[command(name = "chunkyard", version, about = "Resumable chunked-upload server")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "chunkyard.example.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match chunkyard::config::load_config(&cli.config) {
        Ok(config) => Some(config),
        Err(e) if !std::path::Path::new(&cli.config).exists() => {
            eprintln!("config file {} not found ({e}); using defaults", cli.config);
            None
        }
        Err(e) => return Err(e),
    };
    let config = config.unwrap_or_default();

    init_tracing(&config);
    info!(config = %cli.config, "configuration loaded");

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    if config.observability.metrics {
        chunkyard::metrics::init_metrics();
        chunkyard::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let root = &config.upload.root_dir;
    let datastore = LocalDatastore::new(root)?;
    let metadata = MetadataStore::new(root)?;
    info!(root = %metadata.root().display(), "upload directory ready");

    let hooks = DefaultHooks::new(
        config.hooks.public_url.clone(),
        config.upload.base_path.clone(),
    );
    let engine = Arc::new(UploadEngine::new(
        Arc::new(datastore),
        Arc::new(metadata),
        Arc::new(hooks),
        config.engine_options(),
    ));

    if config.expiry.enabled && config.expiry.ttl().is_some() {
        ExpiryReaper::new(engine.clone(), config.expiry.interval()).spawn();
        info!(
            ttl_secs = config.expiry.ttl_secs,
            interval_secs = config.expiry.interval_secs,
            "expiry reaper started"
        );
    }

    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout);
    let state = Arc::new(chunkyard::AppState { config, engine });
    let app = chunkyard::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Chunkyard listening on {}", bind_addr);

    // Stop accepting on SIGTERM/SIGINT; give in-flight chunks a bounded
    // window to finish. Anything cut short is reconciled on next startup.
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    tokio::select! {
        result = server => result?,
        _ = async {
            shutdown_signal().await;
            tokio::time::sleep(shutdown_timeout).await;
        } => warn!("shutdown timeout elapsed; exiting with requests in flight"),
    }

    info!("Chunkyard shut down");

    Ok(())
}

/// `RUST_LOG` wins; otherwise `logging.level`. `logging.format` picks
/// between human-readable text and JSON lines.
fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
