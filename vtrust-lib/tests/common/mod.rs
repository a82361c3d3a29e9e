//! Common test utilities and shared imports

// Not every test file uses every helper
#[allow(unused_imports)]
pub use bytes::Bytes;
#[allow(unused_imports)]
pub use serde_json::{Value, json};
#[allow(unused_imports)]
pub use std::net::Ipv4Addr;
#[allow(unused_imports)]
pub use std::sync::{Arc, Mutex};
#[allow(unused_imports)]
pub use vtrust_lib::crypto::SymmetricKey;
#[allow(unused_imports)]
pub use vtrust_lib::envelope::ProtocolVersion;
#[allow(unused_imports)]
pub use vtrust_lib::firmware::FirmwareInfo;
#[allow(unused_imports)]
pub use vtrust_lib::gateway::{ApiRequest, DevicePhase, GatewayConfig, GatewayService};
#[allow(unused_imports)]
pub use vtrust_lib::smartconfig::{NoProvisioning, ProvisioningControl};
#[allow(unused_imports)]
pub use vtrust_lib::trigger::{TriggerPublisher, UpgradeTrigger};

use async_trait::async_trait;
use std::time::Duration;

/// Gateway address used throughout the tests
#[allow(dead_code)]
pub const GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 42, 42, 1);

/// A device id long enough to pass the MQTT id check
#[allow(dead_code)]
pub const DEVICE_ID: &str = "01200885ecfabc6d0fd1";

#[allow(dead_code)]
pub const FIRMWARE_IMAGE: &[u8] = b"firmware-image";

#[allow(dead_code)]
pub fn zero_key() -> SymmetricKey {
    "0000000000000000".parse().expect("valid key")
}

#[allow(dead_code)]
pub fn sec_key() -> SymmetricKey {
    "abcdefghijklmnop".parse().expect("valid key")
}

/// Keeps every nudge handed to it
#[derive(Default)]
pub struct RecordingPublisher {
    pub published: Mutex<Vec<(String, Vec<u8>)>>,
}

#[async_trait]
impl TriggerPublisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> vtrust_lib::Result<()> {
        self.published.lock().unwrap().push((topic.to_string(), payload));
        Ok(())
    }
}

#[allow(dead_code)]
impl RecordingPublisher {
    pub fn count(&self) -> usize {
        self.published.lock().unwrap().len()
    }
}

/// Gateway with a distinct secKey and a recording MQTT publisher
#[allow(dead_code)]
pub fn gateway(
    provisioning: Arc<dyn ProvisioningControl>,
    delay: Duration,
) -> (Arc<GatewayService>, Arc<RecordingPublisher>) {
    let publisher = Arc::new(RecordingPublisher::default());
    let config = GatewayConfig {
        addr: GATEWAY,
        sec_key: sec_key(),
        local_key: zero_key(),
    };
    let firmware = FirmwareInfo::from_bytes(FIRMWARE_IMAGE, &sec_key()).expect("firmware digests");
    let trigger = Arc::new(UpgradeTrigger::with_delay(zero_key(), publisher.clone(), delay));
    let service = Arc::new(GatewayService::new(config, firmware, provisioning, trigger));
    (service, publisher)
}

#[allow(dead_code)]
pub fn request(a: &str, encrypted: bool, gw_id: &str, body: &[u8]) -> ApiRequest {
    ApiRequest {
        a: Some(a.to_string()),
        et: Some(if encrypted { "1" } else { "0" }.to_string()),
        gw_id: Some(gw_id.to_string()),
        body: Bytes::copy_from_slice(body),
    }
}
