use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratewarden::config::{BackendKind, WardenConfig};
use ratewarden::http::{HttpServer, RequestGuard};
use ratewarden::ratelimit::{LocalStore, RateLimiter, RedisStore, StoreBackend};

/// Per-identifier, per-operation rate limiting service.
#[derive(Parser, Debug)]
#[command(name = "ratewarden", version, about)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address for the HTTP decision service
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Counter store backend
    #[arg(long, value_enum)]
    store: Option<BackendKind>,

    /// Redis URL for the redis backend
    #[arg(long)]
    redis_url: Option<String>,

    /// YAML file with operation rules
    #[arg(long)]
    rules: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting Ratewarden Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = WardenConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }
    if let Some(backend) = args.store {
        config.store.backend = backend;
    }
    if let Some(url) = args.redis_url {
        config.store.redis_url = Some(url);
    }
    if let Some(rules) = args.rules {
        config.rate_limiting.rules_path = Some(rules);
    }
    info!(http_addr = %config.server.http_addr, backend = ?config.store.backend, "Configuration loaded");

    // Invalid rules stop the process here, never at request time.
    let registry = Arc::new(
        config
            .rate_limiting
            .registry()
            .context("loading rate limit rules")?,
    );
    info!(operations = registry.len(), "Rate limit rules loaded");

    let backend = match config.store.backend {
        BackendKind::Local => StoreBackend::Local(Arc::new(LocalStore::new())),
        BackendKind::Redis => {
            let url = config
                .store
                .redis_url
                .as_deref()
                .context("store.redis_url is required for the redis backend")?;
            let store = RedisStore::connect(url, config.store.redis_options())
                .await
                .context("connecting to Redis")?;
            StoreBackend::Redis(Arc::new(store))
        }
    };

    let _sweeper = match &backend {
        StoreBackend::Local(store) => Some(store.spawn_sweeper(config.store.sweep_interval())),
        StoreBackend::Redis(_) => None,
    };

    let limiter = Arc::new(RateLimiter::with_registry(backend.as_store(), registry));
    info!(store = backend.name(), "Rate limiter initialized");

    let guard = RequestGuard::new(limiter, config.headers);
    let server = HttpServer::new(config.server.http_addr, guard);

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Ratewarden Rate Limiting Service stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
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
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
