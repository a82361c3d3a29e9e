//! LAN discovery listener
//!
//! Tuya devices announce themselves on UDP 6666 (plaintext) and 6667
//! (encrypted). Each announcement is `<20-byte header><payload><8-byte
//! trailer>`; the payload is JSON describing the device. Non-ESP SDKs misspell
//! the `ability` key, which is how incompatible devices are spotted.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashSet;
use serde::Deserialize;
use serde_json::Value;
use strum_macros::Display;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::constants::{
    DISCOVERY_FOOTER_SIZE, DISCOVERY_HEADER_SIZE, DISCOVERY_KEY_MAGIC, ESP_ABILITY_KEY, NON_ESP_ABILITY_KEY,
};
use crate::crypto::{SymmetricKey, decrypt_with};

const MAX_DATAGRAM: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DeviceClass {
    /// Announces `ability`; can take ESP firmware
    #[strum(to_string = "ESP82xx")]
    Esp,
    /// Announces `ablilty`; not an ESP82xx
    #[strum(to_string = "non-ESP")]
    NonEsp,
    #[strum(to_string = "unknown")]
    Unknown,
}

/// What one announcement said
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryReport {
    /// Decrypted payload, or the raw payload as text
    pub text: String,
    pub encrypted: bool,
    pub json: Option<Value>,
    pub class: DeviceClass,
}

impl DiscoveryReport {
    pub fn gw_id(&self) -> Option<&str> {
        self.json.as_ref()?.get("gwId")?.as_str()
    }

    /// The identifying fields, if the payload was a JSON object
    pub fn announcement(&self) -> Option<Announcement> {
        serde_json::from_value(self.json.clone()?).ok()
    }
}

/// Identifying fields of an announcement; the rest varies by SDK
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub ip: Option<String>,
    pub gw_id: Option<String>,
    pub product_key: Option<String>,
    pub version: Option<String>,
}

/// Key announcements on 6667 are encrypted with
pub fn discovery_key() -> SymmetricKey {
    SymmetricKey::md5_of(DISCOVERY_KEY_MAGIC)
}

fn strip_framing(datagram: &[u8]) -> &[u8] {
    let end = datagram.len().saturating_sub(DISCOVERY_FOOTER_SIZE);
    datagram.get(DISCOVERY_HEADER_SIZE..end).unwrap_or_default()
}

fn classify(json: Option<&Value>) -> DeviceClass {
    match json.and_then(Value::as_object) {
        Some(object) if object.contains_key(NON_ESP_ABILITY_KEY) => DeviceClass::NonEsp,
        Some(object) if object.contains_key(ESP_ABILITY_KEY) => DeviceClass::Esp,
        _ => DeviceClass::Unknown,
    }
}

/// Decode one announcement, without deduplication
pub fn decode_datagram(datagram: &[u8], key: &SymmetricKey) -> DiscoveryReport {
    let payload = strip_framing(datagram);
    let (text, encrypted) = match decrypt_with(payload, key) {
        Ok(text) => (text, true),
        Err(_) => (String::from_utf8_lossy(payload).into_owned(), false),
    };
    let json = serde_json::from_str::<Value>(&text).ok();
    let class = classify(json.as_ref());

    DiscoveryReport {
        text,
        encrypted,
        json,
        class,
    }
}

/// Decoder with the set of announcements already seen
pub struct DiscoveryDecoder {
    key: SymmetricKey,
    seen: DashSet<Bytes>,
}

impl Default for DiscoveryDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryDecoder {
    pub fn new() -> Self {
        Self {
            key: discovery_key(),
            seen: DashSet::new(),
        }
    }

    /// Decode an announcement unless these exact bytes were seen before
    pub fn process(&self, datagram: &[u8]) -> Option<DiscoveryReport> {
        if !self.seen.insert(Bytes::copy_from_slice(datagram)) {
            return None;
        }
        Some(decode_datagram(datagram, &self.key))
    }

    pub fn seen(&self) -> usize {
        self.seen.len()
    }
}

fn report(from: SocketAddr, report: &DiscoveryReport) {
    info!(from = %from.ip(), encrypted = report.encrypted, "{}", report.text);
    match report.class {
        DeviceClass::NonEsp => warn!(
            from = %from.ip(),
            "It appears this device does not use an ESP82xx and therefore cannot install ESP based firmware"
        ),
        DeviceClass::Esp => {
            if let Some(found) = report.announcement() {
                debug!(
                    from = %from.ip(),
                    gw_id = ?found.gw_id,
                    product_key = ?found.product_key,
                    version = ?found.version,
                    "ESP82xx device"
                );
            }
        }
        DeviceClass::Unknown => {}
    }
}

/// Decode one receive result; a failed receive is logged and skipped
fn take_datagram(
    decoder: &DiscoveryDecoder,
    received: io::Result<(usize, SocketAddr)>,
    buf: &[u8],
) -> Option<(SocketAddr, DiscoveryReport)> {
    match received {
        Ok((len, from)) => decoder.process(&buf[..len]).map(|found| (from, found)),
        Err(e) => {
            warn!("Receive failed: {}", e);
            None
        }
    }
}

/// Receive announcements on `socket` until `shutdown` turns true
pub async fn listen(
    socket: UdpSocket,
    decoder: Arc<DiscoveryDecoder>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    info!("Listening for Tuya broadcast on UDP {}", socket.local_addr()?);
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                if let Some((from, found)) = take_datagram(&decoder, received, &buf) {
                    report(from, &found);
                }
            }
            Ok(_) = shutdown.wait_for(|stop| *stop) => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::encrypt_with;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut datagram = vec![0x55u8; DISCOVERY_HEADER_SIZE];
        datagram.extend_from_slice(payload);
        datagram.extend_from_slice(&[0xAAu8; DISCOVERY_FOOTER_SIZE]);
        datagram
    }

    #[test]
    fn test_discovery_key() {
        assert_eq!(hex::encode(discovery_key().as_bytes()), "6c1ec8e2bb9bb59ab50b0daf649b410a");
    }

    #[test]
    fn test_encrypted_esp_announcement() {
        let json = r#"{"ip":"10.42.42.42","gwId":"01200885ecfabc6d0fd1","active":2,"ability":0,"mode":0,"encrypt":true,"productKey":"keyjup78v54myhan","version":"3.1"}"#;
        let datagram = frame(&encrypt_with(json.as_bytes(), &discovery_key()));

        let report = decode_datagram(&datagram, &discovery_key());
        assert!(report.encrypted);
        assert_eq!(report.text, json);
        assert_eq!(report.class, DeviceClass::Esp);
        assert_eq!(report.gw_id(), Some("01200885ecfabc6d0fd1"));

        let found = report.announcement().unwrap();
        assert_eq!(found.ip.as_deref(), Some("10.42.42.42"));
        assert_eq!(found.product_key.as_deref(), Some("keyjup78v54myhan"));
        assert_eq!(found.version.as_deref(), Some("3.1"));
    }

    #[test]
    fn test_plain_non_esp_announcement() {
        let json = r#"{"ip":"10.42.42.43","gwId":"bf0123456789abcdef","ablilty":0,"version":"3.3"}"#;
        let report = decode_datagram(&frame(json.as_bytes()), &discovery_key());
        assert!(!report.encrypted);
        assert_eq!(report.class, DeviceClass::NonEsp);
    }

    #[test]
    fn test_unparseable_payload() {
        let report = decode_datagram(&frame(b"not json"), &discovery_key());
        assert_eq!(report.text, "not json");
        assert!(report.json.is_none());
        assert_eq!(report.class, DeviceClass::Unknown);
    }

    #[test]
    fn test_short_datagram() {
        let report = decode_datagram(&[1, 2, 3], &discovery_key());
        assert_eq!(report.text, "");
        assert_eq!(report.class, DeviceClass::Unknown);
    }

    #[test]
    fn test_dedup_on_exact_bytes() {
        let decoder = DiscoveryDecoder::new();
        let a = frame(br#"{"gwId":"a","ability":0}"#);
        let mut b = a.clone();
        // Same payload, different header byte: not a duplicate
        b[0] = 0x00;

        assert!(decoder.process(&a).is_some());
        assert!(decoder.process(&a).is_none());
        assert!(decoder.process(&b).is_some());
        assert_eq!(decoder.seen(), 2);
    }

    #[test]
    fn test_receive_error_is_skipped() {
        let decoder = DiscoveryDecoder::new();
        let from: SocketAddr = "10.42.42.42:6666".parse().unwrap();
        let buf = frame(br#"{"gwId":"bf0123456789","ablilty":0}"#);

        let failed = Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(take_datagram(&decoder, failed, &buf).is_none());
        assert_eq!(decoder.seen(), 0);

        let (sender, found) = take_datagram(&decoder, Ok((buf.len(), from)), &buf).unwrap();
        assert_eq!(sender, from);
        assert_eq!(found.class, DeviceClass::NonEsp);
    }
}
