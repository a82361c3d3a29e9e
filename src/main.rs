//! vtrust-flash: every service a Tuya device talks to while being flashed,
//! in one process.
//!
//! Smartconfig provisions the device onto the access point, the fake cloud
//! walks it through activation to an upgrade offer, and the PSK frontends
//! terminate the TLS it insists on. Discovery only reports what it hears.

use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use vtrust_lib::config::{DiscoveryArgs, GatewayArgs, LogArgs, PskArgs, SmartconfigArgs};
use vtrust_lib::constants::{PSK_HINT, SMARTCONFIG_RETRY_DELAY};
use vtrust_lib::discovery::{self, DiscoveryDecoder};
use vtrust_lib::firmware::FirmwareInfo;
use vtrust_lib::http;
use vtrust_lib::logging::setup_logging;
use vtrust_lib::proxy::{PskFrontend, SessionRegistry};
use vtrust_lib::psk::PskAcceptor;
use vtrust_lib::smartconfig::{InProcessStop, SendOutcome, SmartconfigFrame, SmartconfigSender, UdpSink};
use vtrust_lib::GatewayService;

/// How long services get to wind down after Ctrl-C
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Flash Tuya devices over the air
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    log: LogArgs,

    #[command(flatten)]
    gateway: GatewayArgs,

    #[command(flatten)]
    psk: PskArgs,

    #[command(flatten)]
    discovery: DiscoveryArgs,

    #[command(flatten)]
    smartconfig: SmartconfigArgs,

    /// Don't send smartconfig packets; the device is already on the network
    #[arg(long)]
    no_smartconfig: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log.log_file.as_deref(), &cli.log.verbose)?;

    if let Err(e) = run(cli).await {
        error!("vtrust-flash failed: {:?}", e);
        process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let firmware_path = cli.gateway.firmware_path();
    let firmware = FirmwareInfo::load(&firmware_path, &cli.gateway.keys.sec_key)
        .await
        .with_context(|| format!("Cannot serve firmware from {}", firmware_path.display()))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (provisioning, provisioning_stop) = InProcessStop::channel();
    let trigger = Arc::new(cli.gateway.upgrade_trigger());
    let service = Arc::new(GatewayService::new(
        cli.gateway.gateway_config(),
        firmware,
        Arc::new(provisioning),
        trigger.clone(),
    ));

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    let app = http::router(service, cli.gateway.files_dir.clone());
    let listen = cli.gateway.listen_addr();
    let rx = shutdown_rx.clone();
    tasks.spawn(async move { http::serve(listen, app, rx).await.context("HTTP server failed") });

    let acceptor = Arc::new(PskAcceptor::new(PSK_HINT).context("Cannot set up TLS-PSK")?);
    let sessions = Arc::new(SessionRegistry::new());
    for (listen, backend) in cli.psk.routes() {
        let frontend = PskFrontend::bind(listen, backend, acceptor.clone(), sessions.clone())
            .await
            .with_context(|| format!("Cannot listen on {}", listen))?;
        let rx = shutdown_rx.clone();
        tasks.spawn(async move { frontend.run(rx).await.context("PSK frontend failed") });
    }

    let decoder = Arc::new(DiscoveryDecoder::new());
    for addr in cli.discovery.ports() {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("Cannot listen on UDP {}", addr))?;
        let (decoder, rx) = (decoder.clone(), shutdown_rx.clone());
        tasks.spawn(async move { discovery::listen(socket, decoder, rx).await.context("Discovery failed") });
    }

    if cli.no_smartconfig {
        info!("Skipping smartconfig");
    } else {
        let frame = SmartconfigFrame::encode(&cli.smartconfig.payload()).context("Cannot encode smartconfig")?;
        let sink = UdpSink::bind(cli.smartconfig.bind)
            .await
            .with_context(|| format!("Cannot send smartconfig from {}", cli.smartconfig.bind))?;
        let attempts = cli.smartconfig.attempts;
        info!(ssid = %cli.smartconfig.ssid, "Put the device in EZ config mode (LED flashing fast)");
        tasks.spawn(async move {
            let mut sender = SmartconfigSender::new(sink);
            match sender.run(&frame, attempts, SMARTCONFIG_RETRY_DELAY, provisioning_stop).await? {
                SendOutcome::Stopped { attempts } => info!(attempts, "Device picked up its token, smartconfig done"),
                SendOutcome::Completed { attempts } => {
                    warn!(attempts, "No device requested a token; is it in EZ config mode?")
                }
            }
            Ok(())
        });
    }

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break Ok(());
            }
            joined = tasks.join_next() => match joined {
                Some(Ok(Ok(()))) => continue,
                Some(Ok(Err(e))) => break Err(e),
                Some(Err(e)) => break Err(e).context("Service task panicked"),
                None => break Ok(()),
            }
        }
    };

    let _ = shutdown_tx.send(true);
    trigger.shutdown();
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tasks.shutdown().await;
    }
    info!(open_sessions = sessions.len(), "Stopped");

    outcome
}
