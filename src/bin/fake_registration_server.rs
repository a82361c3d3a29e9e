//! Standalone fake Tuya cloud for when smartconfig runs as its own process

use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use vtrust_lib::GatewayService;
use vtrust_lib::config::{GatewayArgs, LogArgs};
use vtrust_lib::firmware::FirmwareInfo;
use vtrust_lib::http;
use vtrust_lib::logging::setup_logging;
use vtrust_lib::smartconfig::ProcessKill;

/// Answer Tuya cloud API calls with an upgrade offer
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    log: LogArgs,

    #[command(flatten)]
    gateway: GatewayArgs,

    /// Exact process name of the smartconfig sender to stop once a token is handed out
    #[arg(long, default_value = "smartconfig")]
    smartconfig_name: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log.log_file.as_deref(), &cli.log.verbose)?;

    if let Err(e) = run(cli).await {
        error!("Registration server failed: {:?}", e);
        process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let firmware_path = cli.gateway.firmware_path();
    let firmware = FirmwareInfo::load(&firmware_path, &cli.gateway.keys.sec_key)
        .await
        .with_context(|| format!("Cannot serve firmware from {}", firmware_path.display()))?;

    let trigger = Arc::new(cli.gateway.upgrade_trigger());
    let service = Arc::new(GatewayService::new(
        cli.gateway.gateway_config(),
        firmware,
        Arc::new(ProcessKill::new(cli.smartconfig_name)),
        trigger.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    let app = http::router(service, cli.gateway.files_dir.clone());
    let served = http::serve(cli.gateway.listen_addr(), app, shutdown_rx)
        .await
        .with_context(|| format!("Cannot serve on {}", cli.gateway.listen_addr()));
    trigger.shutdown();
    served
}
