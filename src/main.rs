use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber;

use turnstile::config::{StoreBackend, TurnstileConfig};
use turnstile::http::HttpServer;
use turnstile::ratelimit::RateLimiter;
use turnstile::store::{KeyValueStore, MemoryStore, RedisStore};

/// Store-backed request throttling service.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Listen address override
    #[arg(short, long)]
    listen: Option<std::net::SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("Starting Turnstile Throttling Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TurnstileConfig::from_file(path)?,
        None => TurnstileConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    info!(listen_addr = %config.server.listen_addr, "Configuration loaded");

    let store = build_store(&config).await;
    let limiter = Arc::new(
        RateLimiter::with_policies(
            store,
            config.rate_limiting.policies.clone(),
            config.rate_limiting.default_strategy,
        )
        .with_store_timeout(std::time::Duration::from_millis(
            config.store.command_timeout_ms,
        )),
    );
    info!("Rate limiter initialized");

    let server = HttpServer::new(config.server.listen_addr, limiter);
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Turnstile Throttling Service stopped");
    Ok(())
}

/// Build the configured store, falling back to memory when Redis cannot be
/// reached at startup. Throttling degrades rather than blocking startup; the
/// fallback is per-instance and does not share quotas across instances.
async fn build_store(config: &TurnstileConfig) -> Arc<dyn KeyValueStore> {
    match config.store.backend {
        StoreBackend::Memory => {
            info!("Using in-memory store");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Redis => match RedisStore::connect(&config.store.redis_url).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                warn!(
                    error = %e,
                    url = %config.store.redis_url,
                    "Redis unavailable at startup, falling back to in-memory store"
                );
                Arc::new(MemoryStore::new())
            }
        },
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
