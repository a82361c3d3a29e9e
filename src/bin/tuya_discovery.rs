//! Print the LAN announcements of nearby Tuya devices

use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use vtrust_lib::config::{DiscoveryArgs, LogArgs};
use vtrust_lib::discovery::{self, DiscoveryDecoder};
use vtrust_lib::logging::setup_logging;

/// Listen for Tuya discovery broadcasts and flag devices that cannot take ESP firmware
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    log: LogArgs,

    #[command(flatten)]
    discovery: DiscoveryArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log.log_file.as_deref(), &cli.log.verbose)?;

    if let Err(e) = run(cli.discovery).await {
        error!("Discovery failed: {:?}", e);
        process::exit(1);
    }

    Ok(())
}

async fn run(args: DiscoveryArgs) -> Result<()> {
    let decoder = Arc::new(DiscoveryDecoder::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut listeners = JoinSet::new();
    for addr in args.ports() {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("Cannot listen on UDP {}", addr))?;
        listeners.spawn(discovery::listen(socket, decoder.clone(), shutdown_rx.clone()));
    }

    tokio::signal::ctrl_c().await.context("Cannot wait for Ctrl-C")?;
    info!(devices = decoder.seen(), "Shutting down");
    let _ = shutdown_tx.send(true);
    while let Some(stopped) = listeners.join_next().await {
        stopped.context("Listener task panicked")?.context("Listener failed")?;
    }
    Ok(())
}
