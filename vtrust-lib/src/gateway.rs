//! Fake Tuya cloud: answers the API calls that walk a device from token
//! request through activation to a firmware upgrade.
//!
//! Replies never carry an error. A device that gets one aborts the whole
//! sequence, so unknown actions and undecryptable payloads still get an empty
//! success.

use std::net::Ipv4Addr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use serde_json::{Value, json};
use strum_macros::Display;
use tracing::{debug, info, warn};

use crate::action::Action;
use crate::constants::{
    EXTENDED_SCHEMA_ENTRIES, MINIMAL_SCHEMA_ENTRIES, NON_ESP_GW_ID, UPGRADE_PATH, UPGRADE_VERSION,
};
use crate::crypto::SymmetricKey;
use crate::envelope::{
    ProtocolVersion, RequestPayload, decode_request_payload, encrypted_response, plain_response,
};
use crate::error::Result;
use crate::firmware::FirmwareInfo;
use crate::smartconfig::ProvisioningControl;
use crate::trigger::UpgradeTrigger;

/// Where a device is in the flashing sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum DevicePhase {
    #[default]
    Unregistered,
    TokenIssued,
    Activated,
    UpgradeOffered,
    UpgradeAcknowledged,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceRecord {
    pub phase: DevicePhase,
    pub activations: u32,
}

/// Devices seen by this process, keyed by `gwId`; entries are never removed
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: DashMap<String, DeviceRecord>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn advance(&self, gw_id: &str, phase: DevicePhase) {
        let mut record = self.devices.entry(gw_id.to_string()).or_default();
        if record.phase != phase {
            info!(gw_id, from = %record.phase, to = %phase, "Device phase");
            record.phase = phase;
        }
    }

    /// Record an activation; true the first time `gw_id` activates
    pub fn record_activation(&self, gw_id: &str) -> bool {
        let mut record = self.devices.entry(gw_id.to_string()).or_default();
        let first = record.activations == 0;
        record.activations += 1;
        if record.phase != DevicePhase::Activated {
            info!(gw_id, from = %record.phase, to = %DevicePhase::Activated, "Device phase");
            record.phase = DevicePhase::Activated;
        }
        first
    }

    pub fn get(&self, gw_id: &str) -> Option<DeviceRecord> {
        self.devices.get(gw_id).map(|r| r.clone())
    }

    pub fn phase(&self, gw_id: &str) -> DevicePhase {
        self.get(gw_id).map(|r| r.phase).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Settings the cloud replies are built from
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address the device is pointed at for every service
    pub addr: Ipv4Addr,
    pub sec_key: SymmetricKey,
    pub local_key: SymmetricKey,
}

/// One API call as it arrived over HTTP
#[derive(Debug, Clone, Default)]
pub struct ApiRequest {
    pub a: Option<String>,
    pub et: Option<String>,
    pub gw_id: Option<String>,
    pub body: Bytes,
}

impl ApiRequest {
    /// Missing parameters read as `"0"`, matching what the device SDK expects
    fn param(value: &Option<String>) -> &str {
        value.as_deref().unwrap_or("0")
    }

    pub fn action_name(&self) -> &str {
        Self::param(&self.a)
    }

    pub fn encrypted(&self) -> bool {
        Self::param(&self.et) == "1"
    }

    pub fn gw_id(&self) -> &str {
        Self::param(&self.gw_id)
    }
}

/// Reply to one API call
#[derive(Debug, Clone, PartialEq)]
pub struct ApiReply {
    pub action: Action,
    pub body: Value,
}

pub struct GatewayService {
    config: GatewayConfig,
    firmware: FirmwareInfo,
    registry: DeviceRegistry,
    provisioning: Arc<dyn ProvisioningControl>,
    trigger: Arc<UpgradeTrigger>,
}

impl GatewayService {
    pub fn new(
        config: GatewayConfig,
        firmware: FirmwareInfo,
        provisioning: Arc<dyn ProvisioningControl>,
        trigger: Arc<UpgradeTrigger>,
    ) -> Self {
        Self {
            config,
            firmware,
            registry: DeviceRegistry::new(),
            provisioning,
            trigger,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn trigger(&self) -> &UpgradeTrigger {
        &self.trigger
    }

    fn url(&self, scheme: &str, path: &str) -> String {
        format!("{}://{}{}", scheme, self.config.addr, path)
    }

    fn log_payload(&self, request: &ApiRequest) {
        match decode_request_payload(&request.body, &self.config.sec_key) {
            RequestPayload::Empty => {}
            RequestPayload::Json(text) => debug!("payload {}", text),
            RequestPayload::Raw { text, error } => {
                warn!("Failed to decrypt payload: {}", error);
                debug!("payload {}", text);
            }
        }
    }

    /// Answer one API call stamped with the current time
    pub fn handle(&self, request: &ApiRequest) -> Result<ApiReply> {
        self.handle_at(request, chrono::Utc::now().timestamp())
    }

    pub fn handle_at(&self, request: &ApiRequest, t: i64) -> Result<ApiReply> {
        let encrypted = request.encrypted();
        let gw_id = request.gw_id();
        let action = Action::parse(request.action_name(), encrypted);

        self.log_payload(request);
        if gw_id == NON_ESP_GW_ID {
            warn!("It appears this device does not use an ESP82xx and therefore cannot install ESP based firmware");
        }
        info!(gw_id, encrypted, "Answer {}", action);

        let body = match &action {
            Action::TokenGet => {
                let reply = self.plain(&self.token_result(encrypted), t);
                self.registry.advance(gw_id, DevicePhase::TokenIssued);
                self.provisioning.stop();
                reply
            }
            Action::Activate => {
                let first = self.registry.record_activation(gw_id);
                let reply = self.plain(&self.activation_result(first), t);
                self.trigger.schedule(gw_id, ProtocolVersion::for_encrypted(encrypted));
                reply
            }
            Action::UpdateStatus => {
                self.registry.advance(gw_id, DevicePhase::UpgradeAcknowledged);
                self.reply(&Value::Null, encrypted, t)?
            }
            Action::UpgradeGetEncrypted => {
                self.registry.advance(gw_id, DevicePhase::UpgradeOffered);
                let result = json!({
                    "auto": 3,
                    "size": self.firmware.len,
                    "type": 0,
                    "pskUrl": self.url("http", UPGRADE_PATH),
                    "hmac": self.firmware.hmac,
                    "version": UPGRADE_VERSION,
                });
                self.reply(&result, encrypted, t)?
            }
            Action::DeviceUpgradeGet => {
                self.registry.advance(gw_id, DevicePhase::UpgradeOffered);
                let result = json!({
                    "auto": true,
                    "type": 0,
                    "size": self.firmware.len,
                    "version": UPGRADE_VERSION,
                    "url": self.url("http", UPGRADE_PATH),
                    "md5": self.firmware.md5,
                });
                self.reply(&result, encrypted, t)?
            }
            Action::LegacyUpgrade => {
                self.registry.advance(gw_id, DevicePhase::UpgradeOffered);
                let result = json!({
                    "auto": 3,
                    "fileSize": self.firmware.len,
                    "etag": "0000000000",
                    "version": UPGRADE_VERSION,
                    "url": self.url("http", UPGRADE_PATH),
                    "md5": self.firmware.md5,
                });
                self.reply(&result, encrypted, t)?
            }
            Action::Log => self.reply(&json!(true), encrypted, t)?,
            Action::Timer => {
                let result = json!({ "devId": gw_id, "count": 0, "lastFetchTime": 0 });
                self.reply(&result, encrypted, t)?
            }
            Action::DynamicConfig => {
                let result = json!({ "validTime": 1800, "time": t, "config": {} });
                self.reply(&result, encrypted, t)?
            }
            Action::Other(name) => {
                debug!(action = %name, "Unhandled action");
                self.reply(&Value::Null, encrypted, t)?
            }
        };

        Ok(ApiReply { action, body })
    }

    fn plain(&self, result: &Value, t: i64) -> Value {
        plain_response(result, t)
    }

    fn reply(&self, result: &Value, encrypted: bool, t: i64) -> Result<Value> {
        if encrypted {
            encrypted_response(result, t, &self.config.sec_key)
        } else {
            Ok(plain_response(result, t))
        }
    }

    fn token_result(&self, encrypted: bool) -> Value {
        let addr = self.config.addr.to_string();
        let mut result = json!({
            "gwApiUrl": self.url("http", "/gw.json"),
            "stdTimeZone": "-05:00",
            "mqttRanges": "",
            "timeZone": "-05:00",
            "httpsPSKUrl": self.url("https", "/gw.json"),
            "mediaMqttUrl": addr,
            "gwMqttUrl": addr,
            "dstIntervals": [],
        });
        if encrypted {
            for key in ["mqttsUrl", "mqttsPSKUrl", "mediaMqttsUrl", "aispeech"] {
                result[key] = json!(addr);
            }
        }
        result
    }

    fn activation_result(&self, first: bool) -> Value {
        let entries = if first { EXTENDED_SCHEMA_ENTRIES } else { MINIMAL_SCHEMA_ENTRIES };
        let entry = json!({ "mode": "rw", "property": { "type": "bool" }, "id": 1, "type": "obj" });
        let schema = Value::Array(vec![entry; entries]).to_string();

        json!({
            "schema": schema,
            "uid": "00000000000000000000",
            "devEtag": "0000000000",
            "secKey": self.config.sec_key.to_text(),
            "schemaId": "0000000000",
            "localKey": self.config.local_key.to_text(),
        })
    }
}
