//! Backhaul broker daemon

use anyhow::{Context, Result};
use backhaul_control::{ClientEvents, ClientRegistry, TunnelFactory};
use backhaul_server::{BrokerConfig, BrokerServer};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Reverse-tunnel broker: relays external connections to services behind
/// NAT through client-originated tunnels.
#[derive(Parser, Debug)]
#[command(name = "backhauld")]
#[command(about = "Reverse-tunnel broker", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, env = "BACKHAUL_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Seconds between keep-alive pings on control connections (0 disables)
    #[arg(long, default_value = "30")]
    keep_alive_interval: u64,

    /// Seconds a forwarding caller waits for its tunnel to be established
    #[arg(long, default_value = "60")]
    tunnel_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let config = BrokerConfig {
        bind_addr: cli.listen,
        keep_alive_interval: match cli.keep_alive_interval {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        },
        tunnel_timeout: Duration::from_secs(cli.tunnel_timeout),
    };

    let registry = Arc::new(ClientRegistry::new(ClientEvents::disabled()));
    let tunnels = Arc::new(TunnelFactory::new());
    let server = BrokerServer::new(config, registry, tunnels);
    let shutdown = server.shutdown_token();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, shutting down");
            shutdown.cancel();
        }
    });

    server.start().await.context("broker failed")?;
    Ok(())
}
