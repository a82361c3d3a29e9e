//! Standalone smartconfig sender

use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use vtrust_lib::config::{LogArgs, SmartconfigArgs};
use vtrust_lib::constants::SMARTCONFIG_RETRY_DELAY;
use vtrust_lib::logging::setup_logging;
use vtrust_lib::smartconfig::{SendOutcome, SmartconfigFrame, SmartconfigSender, UdpSink};

/// Send Wi-Fi credentials to devices in EZ config mode
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    log: LogArgs,

    #[command(flatten)]
    smartconfig: SmartconfigArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log.log_file.as_deref(), &cli.log.verbose)?;

    if let Err(e) = run(cli.smartconfig).await {
        error!("Smartconfig failed: {:?}", e);
        process::exit(1);
    }

    Ok(())
}

async fn run(args: SmartconfigArgs) -> Result<()> {
    let frame = SmartconfigFrame::encode(&args.payload()).context("Cannot encode credentials")?;
    let sink = UdpSink::bind(args.bind)
        .await
        .with_context(|| format!("Cannot send from {}", args.bind))?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = stop_tx.send(true);
        }
    });

    info!(ssid = %args.ssid, "Put the device in EZ config mode (LED flashing fast)");
    let mut sender = SmartconfigSender::new(sink);
    match sender.run(&frame, args.attempts, SMARTCONFIG_RETRY_DELAY, stop_rx).await? {
        SendOutcome::Stopped { attempts } => info!(attempts, "Stopped"),
        SendOutcome::Completed { attempts } => warn!(attempts, "Gave up; no device was provisioned"),
    }
    Ok(())
}
