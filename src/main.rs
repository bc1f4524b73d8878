use anyhow::{Context, Result};
use clap::Parser;
use smart_proxy::{
    RedisCounterStore, Server, TrafficAccountant, load_config, server::DEFAULT_SHUTDOWN_GRACE,
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinSet};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Routes raw TCP connections by TLS SNI or HTTP Host header.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Configuration file (TOML, or YAML for .yaml/.yml).
    config: PathBuf,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, env = "SMART_PROXY_LOG", default_value = "info")]
    log_level: String,

    /// Seconds in-flight sessions may run after Ctrl-C.
    #[arg(long, default_value_t = DEFAULT_SHUTDOWN_GRACE.as_secs())]
    shutdown_grace: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .with_context(|| format!("Invalid log filter {:?}", cli.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(&cli.config)?;
    info!(
        config_file = %cli.config.display(),
        listeners = config.listeners.len(),
        destinations = config.registry.len(),
        traffic_counter = config.traffic_counter.is_some(),
        "Configuration loaded"
    );
    if config.registry.is_empty() {
        warn!("No frontends configured, every connection will be closed");
    }
    if config.listeners.is_empty() {
        warn!("No listeners configured, nothing to serve");
    }

    let accountant = match &config.traffic_counter {
        Some(counter) => {
            let store = RedisCounterStore::connect(&counter.redis_url).await?;
            info!(redis_url = %counter.redis_url, "Traffic accounting enabled");
            Some(TrafficAccountant::new(Arc::new(store)))
        }
        None => None,
    };

    let grace = Duration::from_secs(cli.shutdown_grace);
    let mut servers = Vec::with_capacity(config.listeners.len());
    for settings in &config.listeners {
        let server = Server::bind(settings, Arc::clone(&config.registry), accountant.clone())
            .await?
            .with_shutdown_grace(grace);
        servers.push(server);
    }

    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
        }
        let _ = stop.send(true);
    });

    let mut running = JoinSet::new();
    for server in servers {
        running.spawn(server.run(shutdown.clone()));
    }
    while let Some(result) = running.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %format!("{e:#}"), "Server failed"),
            Err(e) => error!(error = %e, "Server task panicked"),
        }
    }

    info!("All listeners stopped");
    Ok(())
}
