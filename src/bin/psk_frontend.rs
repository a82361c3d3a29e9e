//! TLS-PSK frontends for device HTTPS and MQTTS

use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use vtrust_lib::config::{LogArgs, PskArgs};
use vtrust_lib::constants::PSK_HINT;
use vtrust_lib::logging::setup_logging;
use vtrust_lib::proxy::{PskFrontend, SessionRegistry};
use vtrust_lib::psk::PskAcceptor;

/// Terminate device TLS-PSK and relay plaintext to the local HTTP and MQTT services
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    log: LogArgs,

    #[command(flatten)]
    psk: PskArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log.log_file.as_deref(), &cli.log.verbose)?;

    if let Err(e) = run(cli.psk).await {
        error!("PSK frontend failed: {:?}", e);
        process::exit(1);
    }

    Ok(())
}

async fn run(args: PskArgs) -> Result<()> {
    let acceptor = Arc::new(PskAcceptor::new(PSK_HINT).context("Cannot set up TLS-PSK")?);
    let sessions = Arc::new(SessionRegistry::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut frontends = JoinSet::new();
    for (listen, backend) in args.routes() {
        let frontend = PskFrontend::bind(listen, backend, acceptor.clone(), sessions.clone())
            .await
            .with_context(|| format!("Cannot listen on {}", listen))?;
        frontends.spawn(frontend.run(shutdown_rx.clone()));
    }

    tokio::signal::ctrl_c().await.context("Cannot wait for Ctrl-C")?;
    info!(open_sessions = sessions.len(), "Shutting down");
    let _ = shutdown_tx.send(true);
    while let Some(stopped) = frontends.join_next().await {
        stopped.context("Frontend task panicked")?.context("Frontend failed")?;
    }
    Ok(())
}
