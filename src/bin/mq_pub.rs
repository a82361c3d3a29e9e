//! Publish one upgrade nudge to a device over MQTT

use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use tracing::error;

use vtrust_lib::SymmetricKey;
use vtrust_lib::constants::{DEFAULT_LOCAL_KEY, MQTT_PORT};
use vtrust_lib::envelope::ProtocolVersion;
use vtrust_lib::logging::setup_logging;
use vtrust_lib::trigger::{MqttPublisher, UpgradeTrigger, validate_device_id};

/// Tell a device to check for a firmware upgrade
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Device id (gwId), at least 10 characters
    #[arg(short = 'i', long = "device-id", visible_alias = "deviceID")]
    device_id: String,

    /// Key the message is encrypted with
    #[arg(short = 'l', long = "local-key", visible_alias = "localKey", default_value = DEFAULT_LOCAL_KEY)]
    local_key: SymmetricKey,

    #[arg(short, long, default_value = "127.0.0.1")]
    broker: String,

    #[arg(long, default_value_t = MQTT_PORT)]
    port: u16,

    /// Envelope version: 2.1 or 2.2
    #[arg(short, long, default_value = "2.1")]
    protocol: ProtocolVersion,

    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(None, &cli.verbose)?;

    if let Err(e) = run(cli).await {
        error!("mq_pub failed: {:?}", e);
        process::exit(2);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    validate_device_id(&cli.device_id)?;
    let publisher = Arc::new(MqttPublisher::new(cli.broker.clone(), cli.port));
    let trigger = UpgradeTrigger::new(cli.local_key, publisher);
    trigger
        .fire(&cli.device_id, cli.protocol)
        .await
        .with_context(|| format!("Cannot publish to {}:{}", cli.broker, cli.port))
}
