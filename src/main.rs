use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::cache::{Cache, MemoryCache, MeshCache};
use tollgate::config::{CacheBackend, LogFormat, LoggingConfig, TollgateConfig};
use tollgate::mesh::Cluster;
use tollgate::ratelimit::RateLimiter;
use tollgate::server::DecisionServer;

/// Token-bucket rate limiting service.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the decision server address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Override the log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = TollgateConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }

    init_tracing(&config.logging);

    info!("Starting Tollgate Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        listen_addr = %config.server.listen_addr,
        backend = ?config.cache.backend,
        "Configuration loaded"
    );

    let (cache, cluster): (Arc<dyn Cache>, Option<Arc<Cluster>>) = match config.cache.backend {
        CacheBackend::Memory => (Arc::new(MemoryCache::new()) as Arc<dyn Cache>, None),
        CacheBackend::Mesh => {
            let cluster = Arc::new(
                Cluster::start(config.cache.mesh.cluster_config())
                    .await
                    .context("Failed to join the mesh")?,
            );
            (
                Arc::new(MeshCache::new(cluster.clone())) as Arc<dyn Cache>,
                Some(cluster),
            )
        }
    };

    let rate_limiter = Arc::new(RateLimiter::new(config.limiter.options().with_cache(cache)));
    info!(
        max_rate_per_second = rate_limiter.max_rate_per_second(),
        max_burst = rate_limiter.max_burst(),
        cache_ttl = ?rate_limiter.cache_ttl(),
        "Rate limiter initialized"
    );

    let server = DecisionServer::new(config.server.listen_addr, rate_limiter);
    server.serve_with_shutdown(shutdown_signal()).await?;

    if let Some(cluster) = cluster {
        // The limiter and its cache were dropped with the server
        match Arc::try_unwrap(cluster) {
            Ok(cluster) => cluster.shutdown().await?,
            Err(_) => info!("Cluster still referenced, skipping graceful leave"),
        }
    }

    info!("Tollgate Rate Limiting Service stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
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
