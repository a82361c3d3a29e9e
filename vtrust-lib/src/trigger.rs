//! MQTT upgrade nudge
//!
//! After activation a device sits idle until the cloud tells it to look for
//! firmware. Publishing protocol 15 to its input topic makes it issue the
//! upgrade check right away.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, QoS};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::constants::{
    MQTT_DEVICE_TOPIC_PREFIX, MQTT_TRIGGER_PROTOCOL, MQTT_TRIGGER_SEQUENCE, UPGRADE_TRIGGER_DELAY,
};
use crate::crypto::SymmetricKey;
use crate::envelope::{ProtocolVersion, encode_message};
use crate::error::{FlashError, Result};

/// Device ids shorter than this are refused
pub const MIN_DEVICE_ID_LEN: usize = 10;

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Plaintext of the nudge; `2.2` devices expect `s` and `t` as strings
pub fn nudge_message(gw_id: &str, version: ProtocolVersion, t: i64) -> String {
    let message = match version {
        ProtocolVersion::V21 => json!({
            "data": { "gwId": gw_id },
            "protocol": MQTT_TRIGGER_PROTOCOL,
            "s": MQTT_TRIGGER_SEQUENCE,
            "t": t,
        }),
        ProtocolVersion::V22 => json!({
            "data": { "gwId": gw_id },
            "protocol": MQTT_TRIGGER_PROTOCOL,
            "s": MQTT_TRIGGER_SEQUENCE.to_string(),
            "t": t.to_string(),
        }),
    };
    message.to_string()
}

pub fn device_topic(gw_id: &str) -> String {
    format!("{MQTT_DEVICE_TOPIC_PREFIX}{gw_id}")
}

pub fn validate_device_id(gw_id: &str) -> Result<()> {
    if gw_id.len() < MIN_DEVICE_ID_LEN {
        return Err(FlashError::MalformedMessage(format!(
            "device id {gw_id:?} is shorter than {MIN_DEVICE_ID_LEN} characters"
        )));
    }
    Ok(())
}

/// Where nudges get published
#[async_trait]
pub trait TriggerPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

/// Connect, publish once at QoS 0, disconnect
#[derive(Debug, Clone)]
pub struct MqttPublisher {
    host: String,
    port: u16,
}

impl MqttPublisher {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    async fn publish_once(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let client_id = format!("vtrust-flash-{}", std::process::id());
        let mut options = MqttOptions::new(client_id, &self.host, self.port);
        options.set_keep_alive(Duration::from_secs(30));

        let (client, mut eventloop) = AsyncClient::new(options, 10);
        client.publish(topic, QoS::AtMostOnce, false, payload).await?;

        loop {
            match eventloop.poll().await? {
                Event::Outgoing(Outgoing::Publish(_)) => {
                    debug!(topic, "Published");
                    client.disconnect().await?;
                }
                Event::Outgoing(Outgoing::Disconnect) => return Ok(()),
                _ => {}
            }
        }
    }
}

#[async_trait]
impl TriggerPublisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        tokio::time::timeout(PUBLISH_TIMEOUT, self.publish_once(topic, payload))
            .await
            .map_err(|_| FlashError::Mqtt(format!("publish to {}:{} timed out", self.host, self.port)))?
    }
}

/// Sends upgrade nudges, immediately or after the activation delay
pub struct UpgradeTrigger {
    local_key: SymmetricKey,
    publisher: Arc<dyn TriggerPublisher>,
    delay: Duration,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl UpgradeTrigger {
    pub fn new(local_key: SymmetricKey, publisher: Arc<dyn TriggerPublisher>) -> Self {
        Self::with_delay(local_key, publisher, UPGRADE_TRIGGER_DELAY)
    }

    pub fn with_delay(local_key: SymmetricKey, publisher: Arc<dyn TriggerPublisher>, delay: Duration) -> Self {
        Self {
            local_key,
            publisher,
            delay,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Publish a nudge for `gw_id` now
    pub async fn fire(&self, gw_id: &str, version: ProtocolVersion) -> Result<()> {
        fire(&self.local_key, self.publisher.as_ref(), gw_id, version).await
    }

    /// Publish a nudge after the configured delay without blocking the caller
    pub fn schedule(&self, gw_id: &str, version: ProtocolVersion) {
        let local_key = self.local_key.clone();
        let publisher = Arc::clone(&self.publisher);
        let gw_id = gw_id.to_string();
        let delay = self.delay;

        info!(gw_id = %gw_id, protocol = %version, "Upgrade trigger in {}s", delay.as_secs());
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = fire(&local_key, publisher.as_ref(), &gw_id, version).await {
                warn!(gw_id = %gw_id, "Upgrade trigger failed: {}", e);
            }
        });

        if let Ok(mut pending) = self.pending.lock() {
            pending.retain(|h| !h.is_finished());
            pending.push(handle);
        }
    }

    /// Number of scheduled nudges that have not run yet
    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .map(|pending| pending.iter().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }

    /// Abort every nudge still waiting
    pub fn shutdown(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            for handle in pending.drain(..) {
                handle.abort();
            }
        }
    }
}

async fn fire(
    local_key: &SymmetricKey,
    publisher: &dyn TriggerPublisher,
    gw_id: &str,
    version: ProtocolVersion,
) -> Result<()> {
    validate_device_id(gw_id)?;
    let message = nudge_message(gw_id, version, Utc::now().timestamp());
    debug!(gw_id, protocol = %version, "Encoding {}", message);
    let wire = encode_message(&message, local_key, version);
    publisher.publish(&device_topic(gw_id), wire).await?;
    info!(gw_id, protocol = %version, "Upgrade trigger published");
    Ok(())
}
