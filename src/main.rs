//! Tuncat - Point-to-point IP tunnel over TCP
//!
//! `tuncat listen` waits for a peer, `tuncat connect` dials one. Both ends
//! create a TUN interface and relay IP packets until either side goes away.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tuncat::config::{normalize_network, validate_gateway, TuncatConfig};
use tuncat::device::TunProvider;
use tuncat::handshake::TunnelParams;
use tuncat::netconfig::{for_current_platform, SystemRunner};
use tuncat::session::{Initiator, Responder, SessionOptions};

/// Tuncat - Point-to-point IP tunnel over TCP
#[derive(Parser)]
#[command(name = "tuncat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to an optional configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a listening peer
    Connect {
        /// Peer host name or address
        #[arg(long)]
        dst_host: String,

        /// Peer port
        #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
        dst_port: u16,

        /// Address of the local tunnel interface
        #[arg(long)]
        if_address: Option<String>,

        /// Network reachable through the tunnel (CIDR)
        #[arg(long, default_value = "")]
        remote_network: String,

        /// Gateway the peer should use for the remote network
        #[arg(long, default_value = "")]
        remote_gateway: String,
    },

    /// Wait for peers to connect
    Listen {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0")]
        src_host: String,

        /// Port to listen on
        #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
        src_port: u16,

        /// Address of the local tunnel interface
        #[arg(long)]
        if_address: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => TuncatConfig::from_file(path),
        None => Ok(TuncatConfig::default()),
    };

    // Initialize logging
    let level = match (&cli.log_level, &config) {
        (Some(level), _) => level.clone(),
        (None, Ok(config)) => config.logging.level.clone(),
        (None, Err(_)) => "info".to_string(),
    };
    init_logging(&level);

    let config = config.with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;
    warn_if_not_root();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
        }
    });

    match cli.command {
        Commands::Connect {
            dst_host,
            dst_port,
            if_address,
            remote_network,
            remote_gateway,
        } => {
            let params = TunnelParams::new(
                normalize_network(&remote_network)?,
                validate_gateway(&remote_gateway)?,
            );
            let options = config.session_options(if_address.as_deref())?;
            run_connect(dst_host, dst_port, params, options, config.tun_provider(), shutdown_rx).await
        }
        Commands::Listen {
            src_host,
            src_port,
            if_address,
        } => {
            let options = config.session_options(if_address.as_deref())?;
            run_listen(src_host, src_port, options, config.tun_provider(), shutdown_rx).await
        }
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Creating interfaces and changing routes needs elevated privileges
fn warn_if_not_root() {
    #[cfg(unix)]
    if !nix::unistd::Uid::effective().is_root() {
        tracing::warn!("Not running as root; interface and route setup will probably fail");
    }
}

/// Dial the peer and run one session
async fn run_connect(
    host: String,
    port: u16,
    params: TunnelParams,
    options: SessionOptions,
    provider: TunProvider,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    tracing::info!("Starting tuncat initiator...");

    let configurator = for_current_platform(Arc::new(SystemRunner));
    let initiator = Initiator::new(host, port, params, options, provider, configurator);
    initiator.run(shutdown).await.context("Tunnel session failed")?;

    tracing::info!("Tuncat initiator stopped");
    Ok(())
}

/// Serve peers one at a time until shutdown
async fn run_listen(
    host: String,
    port: u16,
    options: SessionOptions,
    provider: TunProvider,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    tracing::info!("Starting tuncat responder...");

    let configurator = for_current_platform(Arc::new(SystemRunner));
    let responder = Responder::new(options, provider, configurator);
    responder
        .run(&host, port, shutdown)
        .await
        .context("Responder failed")?;

    Ok(())
}
