//! EdgeTunnel server binary

use anyhow::{Context, Result};
use clap::Parser;
use edgetunnel::Authenticator;
use edgetunnel::registry::{CachedNodeStore, FileNodeStore, MemoryNodeStore, NodeStore};
use edgetunnel::relay::{BackendPolicy, TcpDialer, TunnelRelay};
use edgetunnel::server::{AppState, EdgeTunnelConfig, create_router};
use edgetunnel_core::ValidateConfig;
use edgetunnel_core::tracing::{InstrumentationConfig, init_tracing, metrics};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// EdgeTunnel - VLESS and Trojan over WebSocket
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config")]
    config: Option<String>,

    /// Listen address, overrides `server.bind_addr`
    #[arg(short = 'b', long = "bind")]
    bind: Option<SocketAddr>,
}

fn build_store(config: &EdgeTunnelConfig) -> Arc<dyn NodeStore> {
    let ttl = config.registry.cache_ttl();
    if let Some(path) = &config.registry.path {
        if !config.registry.seed.is_empty() {
            warn!("registry.seed is ignored when registry.path is set");
        }
        info!("Using node file {}", path.display());
        Arc::new(CachedNodeStore::new(FileNodeStore::new(path), ttl))
    } else {
        info!(
            nodes = config.registry.seed.len(),
            "Using in-memory node registry"
        );
        let store = MemoryNodeStore::with_records(config.registry.seed.iter().cloned());
        Arc::new(CachedNodeStore::new(store, ttl))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        EdgeTunnelConfig::load_from_file(config_path)
            .with_context(|| format!("failed to load configuration from {config_path}"))?
    } else {
        EdgeTunnelConfig::load().context("failed to load configuration")?
    };
    if let Some(bind) = cli.bind {
        config.server.bind_addr = bind;
    }
    config.validate().context("invalid configuration")?;

    let instrumentation =
        InstrumentationConfig::from_env().with_log_level(config.server.log_level.clone());
    init_tracing(&instrumentation)?;

    info!("Starting EdgeTunnel {}", env!("CARGO_PKG_VERSION"));
    if cli.config.is_some() {
        info!("Configuration loaded from {:?}", cli.config);
    }

    let relay_config = config.tunnel.relay_config();
    match &relay_config.backend {
        BackendPolicy::Fixed(address) => info!("Relaying every session to {}", address),
        BackendPolicy::Direct => info!("Relaying sessions to their requested targets"),
        BackendPolicy::Unconfigured => {
            warn!("No backend configured; tunnel requests will be answered with 500");
        }
    }

    let store = build_store(&config);
    let cancel = CancellationToken::new();
    let relay = TunnelRelay::new(
        relay_config,
        Authenticator::new(Arc::clone(&store)),
        TcpDialer,
    )
    .with_cancellation(cancel.clone());

    let state = AppState::new(relay, store, &config);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(config.server.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_addr))?;
    info!("Listening on {}", listener.local_addr()?);

    let shutdown = cancel.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutting down...");
        // Upgraded tunnels are not tracked by the server, cancel them here
        shutdown.cancel();
    })
    .await?;

    metrics::global().log_all();
    Ok(())
}
