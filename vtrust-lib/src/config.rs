//! Command-line arguments shared by the binaries
//!
//! Every flag can also come from a `VTRUST_*` environment variable. Defaults
//! match the access point the flashing host brings up.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use clap_verbosity_flag::{InfoLevel, Verbosity};

use crate::constants::{
    DEFAULT_GATEWAY, DISCOVERY_ENCRYPTED_PORT, DISCOVERY_PLAIN_PORT, HTTP_PORT, HTTPS_PORT, MQTT_PORT,
    MQTTS_PORT, SMARTCONFIG_ATTEMPTS,
};
use crate::crypto::SymmetricKey;
use crate::gateway::GatewayConfig;
use crate::smartconfig::SmartconfigPayload;
use crate::trigger::{MqttPublisher, UpgradeTrigger};

#[derive(Args, Debug, Clone)]
pub struct LogArgs {
    /// Also write logs to this file
    #[arg(long, env = "VTRUST_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

/// Keys handed to and used with devices
#[derive(Args, Debug, Clone)]
pub struct KeyArgs {
    /// Key for the encrypted cloud API (`secKey`)
    #[arg(long, env = "VTRUST_SEC_KEY", default_value = "0000000000000000")]
    pub sec_key: SymmetricKey,

    /// Key for MQTT messages (`localKey`)
    #[arg(long, env = "VTRUST_LOCAL_KEY", default_value = "0000000000000000")]
    pub local_key: SymmetricKey,
}

#[derive(Args, Debug, Clone)]
pub struct MqttArgs {
    /// Broker the upgrade nudge is published to
    #[arg(long, env = "VTRUST_MQTT_BROKER", default_value = "127.0.0.1")]
    pub mqtt_broker: String,

    #[arg(long, env = "VTRUST_MQTT_PORT", default_value_t = MQTT_PORT)]
    pub mqtt_port: u16,
}

impl MqttArgs {
    pub fn publisher(&self) -> MqttPublisher {
        MqttPublisher::new(self.mqtt_broker.clone(), self.mqtt_port)
    }
}

/// Fake registration server
#[derive(Args, Debug, Clone)]
pub struct GatewayArgs {
    /// Address devices are pointed at, and the HTTP server binds to
    #[arg(long, env = "VTRUST_ADDR", default_value_t = DEFAULT_GATEWAY)]
    pub addr: Ipv4Addr,

    #[arg(long, env = "VTRUST_PORT", default_value_t = HTTP_PORT)]
    pub port: u16,

    /// Directory served under /files; must contain upgrade.bin
    #[arg(long, env = "VTRUST_FILES_DIR", default_value = "../files")]
    pub files_dir: PathBuf,

    #[command(flatten)]
    pub keys: KeyArgs,

    #[command(flatten)]
    pub mqtt: MqttArgs,
}

impl GatewayArgs {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddrV4::new(self.addr, self.port).into()
    }

    pub fn firmware_path(&self) -> PathBuf {
        self.files_dir.join("upgrade.bin")
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            addr: self.addr,
            sec_key: self.keys.sec_key.clone(),
            local_key: self.keys.local_key.clone(),
        }
    }

    pub fn upgrade_trigger(&self) -> UpgradeTrigger {
        UpgradeTrigger::new(self.keys.local_key.clone(), Arc::new(self.mqtt.publisher()))
    }
}

/// TLS-PSK frontends
#[derive(Args, Debug, Clone)]
pub struct PskArgs {
    /// Address the frontends listen on and relay to
    #[arg(long, env = "VTRUST_PSK_ADDR", default_value_t = DEFAULT_GATEWAY)]
    pub psk_addr: Ipv4Addr,
}

impl PskArgs {
    /// (listen, backend) pairs: HTTPS to HTTP and MQTTS to MQTT
    pub fn routes(&self) -> [(SocketAddr, SocketAddr); 2] {
        let at = |port| SocketAddr::from(SocketAddrV4::new(self.psk_addr, port));
        [(at(HTTPS_PORT), at(HTTP_PORT)), (at(MQTTS_PORT), at(MQTT_PORT))]
    }
}

/// Discovery listeners
#[derive(Args, Debug, Clone)]
pub struct DiscoveryArgs {
    #[arg(long, env = "VTRUST_DISCOVERY_BIND", default_value_t = Ipv4Addr::UNSPECIFIED)]
    pub discovery_bind: Ipv4Addr,
}

impl DiscoveryArgs {
    pub fn ports(&self) -> [SocketAddr; 2] {
        [DISCOVERY_PLAIN_PORT, DISCOVERY_ENCRYPTED_PORT].map(|port| SocketAddrV4::new(self.discovery_bind, port).into())
    }
}

/// Smartconfig sender
#[derive(Args, Debug, Clone)]
pub struct SmartconfigArgs {
    #[arg(long, env = "VTRUST_SSID", default_value = "vtrust-flash")]
    pub ssid: String,

    #[arg(long, env = "VTRUST_WIFI_PASSWORD", default_value = "")]
    pub password: String,

    #[arg(long, default_value = "US")]
    pub region: String,

    #[arg(long, default_value = "00000000")]
    pub token: String,

    #[arg(long, default_value = "0101")]
    pub secret: String,

    /// Local address the packets are sent from
    #[arg(long, env = "VTRUST_SMARTCONFIG_BIND", default_value_t = DEFAULT_GATEWAY)]
    pub bind: Ipv4Addr,

    #[arg(long, default_value_t = SMARTCONFIG_ATTEMPTS)]
    pub attempts: usize,
}

impl SmartconfigArgs {
    pub fn payload(&self) -> SmartconfigPayload {
        SmartconfigPayload::new(&self.ssid, &self.password, &self.region, &self.token, &self.secret)
    }
}
