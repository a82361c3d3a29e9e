//! Cloud message envelopes
//!
//! Two families live here:
//!
//! - MQTT protocol messages, versions `2.1` (signed base64) and `2.2`
//!   (CRC-framed binary), used for the upgrade nudge
//! - HTTP API replies, either plain JSON or an encrypted and signed `result`
//!
//! plus decoding of the hex-encoded encrypted body devices attach to API
//! requests.

use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use byteorder::{BigEndian, ByteOrder};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use strum_macros::{Display, IntoStaticStr};

use crate::constants::REQUEST_PAYLOAD_PREFIX_LEN;
use crate::crc::crc32_unsigned;
use crate::crypto::{SymmetricKey, decrypt_with, encrypt_with, md5_hex};
use crate::error::{FlashError, Result};

const VERSION_LEN: usize = 3;
const SIGNATURE_LEN: usize = 16;
const CRC_LEN: usize = 4;
const TIMESTAMP_LEN: usize = 8;

/// Wire version of an MQTT protocol message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum ProtocolVersion {
    #[strum(to_string = "2.1")]
    V21,
    #[strum(to_string = "2.2")]
    V22,
}

impl ProtocolVersion {
    /// Devices that talk to the encrypted API expect `2.2` messages
    pub fn for_encrypted(encrypted: bool) -> Self {
        if encrypted { Self::V22 } else { Self::V21 }
    }

    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

impl FromStr for ProtocolVersion {
    type Err = FlashError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "2.1" => Ok(Self::V21),
            "2.2" => Ok(Self::V22),
            other => Err(FlashError::MalformedMessage(format!("unknown protocol version {other:?}"))),
        }
    }
}

/// First 16 hex chars after offset 8 of an MD5 digest
fn md5_mid(data: &str) -> String {
    md5_hex(data.as_bytes())[8..24].to_string()
}

/// Signature of a `2.1` message over its base64 body
pub fn message_signature(b64: &str, version: ProtocolVersion, key: &SymmetricKey) -> String {
    md5_mid(&format!("data={}||pv={}||{}", b64, version, key.to_text()))
}

/// `2.2` timestamp: hundredths of a second, last eight digits
pub fn message_timestamp(now: DateTime<Utc>) -> String {
    let hundredths = now.timestamp_millis().div_euclid(10).rem_euclid(100_000_000);
    format!("{hundredths:08}")
}

/// Encode a protocol message stamped with the current time
pub fn encode_message(plaintext: &str, key: &SymmetricKey, version: ProtocolVersion) -> Vec<u8> {
    encode_message_at(plaintext, key, version, Utc::now())
}

/// Encode a protocol message
///
/// - `2.1`: `"2.1" ‖ sig ‖ base64(ciphertext)`
/// - `2.2`: `"2.2" ‖ crc32_be(ts ‖ ciphertext) ‖ ts ‖ ciphertext`
pub fn encode_message_at(
    plaintext: &str,
    key: &SymmetricKey,
    version: ProtocolVersion,
    now: DateTime<Utc>,
) -> Vec<u8> {
    let ciphertext = encrypt_with(plaintext.as_bytes(), key);
    let mut out = Vec::from(version.as_str().as_bytes());

    match version {
        ProtocolVersion::V21 => {
            let b64 = BASE64.encode(&ciphertext);
            out.extend_from_slice(message_signature(&b64, version, key).as_bytes());
            out.extend_from_slice(b64.as_bytes());
        }
        ProtocolVersion::V22 => {
            let mut body = Vec::from(message_timestamp(now).as_bytes());
            body.extend_from_slice(&ciphertext);

            let mut crc = [0u8; CRC_LEN];
            BigEndian::write_u32(&mut crc, crc32_unsigned(&body));
            out.extend_from_slice(&crc);
            out.extend_from_slice(&body);
        }
    }
    out
}

/// A verified and decrypted protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    pub version: ProtocolVersion,
    /// Only `2.2` messages carry one
    pub timestamp: Option<String>,
    pub plaintext: String,
}

/// Verify and decrypt a protocol message
///
/// # Errors
/// `MalformedMessage` for an unknown version prefix, a truncated frame, bad
/// base64 or a signature/CRC mismatch; decryption errors from [`crate::crypto`].
pub fn decode_message(wire: &[u8], key: &SymmetricKey) -> Result<DecodedMessage> {
    let prefix = wire
        .get(..VERSION_LEN)
        .ok_or_else(|| FlashError::MalformedMessage("message shorter than its version".into()))?;
    let version: ProtocolVersion = std::str::from_utf8(prefix)
        .map_err(|_| FlashError::MalformedMessage("non-ASCII version prefix".into()))?
        .parse()?;

    match version {
        ProtocolVersion::V21 => {
            let rest = &wire[VERSION_LEN..];
            if rest.len() < SIGNATURE_LEN {
                return Err(FlashError::MalformedMessage("truncated 2.1 signature".into()));
            }
            let (signature, b64) = rest.split_at(SIGNATURE_LEN);
            let b64 = std::str::from_utf8(b64)
                .map_err(|_| FlashError::MalformedMessage("2.1 body is not base64 text".into()))?;
            if signature != message_signature(b64, version, key).as_bytes() {
                return Err(FlashError::MalformedMessage("2.1 signature mismatch".into()));
            }
            let ciphertext = BASE64.decode(b64)?;
            Ok(DecodedMessage {
                version,
                timestamp: None,
                plaintext: decrypt_with(&ciphertext, key)?,
            })
        }
        ProtocolVersion::V22 => {
            let rest = &wire[VERSION_LEN..];
            if rest.len() < CRC_LEN + TIMESTAMP_LEN {
                return Err(FlashError::MalformedMessage("truncated 2.2 header".into()));
            }
            let (crc, body) = rest.split_at(CRC_LEN);
            if BigEndian::read_u32(crc) != crc32_unsigned(body) {
                return Err(FlashError::MalformedMessage("2.2 CRC mismatch".into()));
            }
            let (timestamp, ciphertext) = body.split_at(TIMESTAMP_LEN);
            Ok(DecodedMessage {
                version,
                timestamp: Some(String::from_utf8_lossy(timestamp).into_owned()),
                plaintext: decrypt_with(ciphertext, key)?,
            })
        }
    }
}

/// Whether a value counts as present: not null, false, zero or empty
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// `sign` field of an encrypted reply
pub fn response_signature(payload: &str, t: i64, key: &SymmetricKey) -> String {
    md5_mid(&format!("result={}||t={}||{}", payload, t, key.to_text()))
}

/// `{t, e:false, success:true}` plus `result` when it is truthy
pub fn plain_response(result: &Value, t: i64) -> Value {
    let mut answer = json!({ "t": t, "e": false, "success": true });
    if is_truthy(result) {
        answer["result"] = result.clone();
    }
    answer
}

/// `{result: base64(encrypt({result, t, success})), t, sign}`
pub fn encrypted_response(result: &Value, t: i64, key: &SymmetricKey) -> Result<Value> {
    let inner = json!({ "result": result, "t": t, "success": true });
    let serialized = serde_json::to_string(&inner)?;
    let payload = BASE64.encode(encrypt_with(serialized.as_bytes(), key));
    let sign = response_signature(&payload, t, key);
    Ok(json!({ "result": payload, "t": t, "sign": sign }))
}

/// Open an encrypted reply, checking its signature; returns the inner object
pub fn open_encrypted_response(response: &Value, key: &SymmetricKey) -> Result<Value> {
    let payload = response["result"]
        .as_str()
        .ok_or_else(|| FlashError::MalformedMessage("reply has no string result".into()))?;
    let t = response["t"]
        .as_i64()
        .ok_or_else(|| FlashError::MalformedMessage("reply has no timestamp".into()))?;
    if response["sign"].as_str() != Some(response_signature(payload, t, key).as_str()) {
        return Err(FlashError::MalformedMessage("reply signature mismatch".into()));
    }
    let plaintext = decrypt_with(&BASE64.decode(payload)?, key)?;
    Ok(serde_json::from_str(&plaintext)?)
}

/// Body attached to an API request
#[derive(Debug)]
pub enum RequestPayload {
    Empty,
    /// Decrypted JSON text
    Json(String),
    /// Could not be decrypted as JSON; kept for logging
    Raw { text: String, error: FlashError },
}

/// Hex-decode and decrypt a request body after its `data=` prefix
///
/// Never fails: anything that doesn't decrypt to text starting with `{` comes
/// back as [`RequestPayload::Raw`].
pub fn decode_request_payload(body: &[u8], key: &SymmetricKey) -> RequestPayload {
    let payload = body.get(REQUEST_PAYLOAD_PREFIX_LEN..).unwrap_or_default();
    if payload.is_empty() {
        return RequestPayload::Empty;
    }

    let decoded = hex::decode(payload)
        .map_err(FlashError::from)
        .and_then(|ciphertext| decrypt_with(&ciphertext, key))
        .and_then(|text| {
            if text.starts_with('{') {
                Ok(text)
            } else {
                Err(FlashError::DecryptionFailure("payload is not JSON".into()))
            }
        });

    match decoded {
        Ok(text) => RequestPayload::Json(text),
        Err(error) => RequestPayload::Raw {
            text: String::from_utf8_lossy(payload).into_owned(),
            error,
        },
    }
}

/// Hex body in the shape devices send: `data=<hex ciphertext>`
pub fn encode_request_payload(json: &str, key: &SymmetricKey) -> Vec<u8> {
    let mut body = b"data=".to_vec();
    body.extend_from_slice(hex::encode(encrypt_with(json.as_bytes(), key)).as_bytes());
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zero_key() -> SymmetricKey {
        "0000000000000000".parse().unwrap()
    }

    const NUDGE_21: &str = r#"{"data":{"gwId":"0123456789abcdef"},"protocol":15,"s":1523715,"t":1700000000}"#;
    const NUDGE_22: &str = r#"{"data":{"gwId":"0123456789abcdef"},"protocol":15,"s":"1523715","t":"1700000000"}"#;

    fn at_millis(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    #[test]
    fn test_encode_21_known_vector() {
        let wire = encode_message(NUDGE_21, &zero_key(), ProtocolVersion::V21);
        assert_eq!(
            String::from_utf8(wire).unwrap(),
            "2.189361258d9dc63cat5inCMDHpcJKQpxfOe2RbUh3yHgGBkrBZkEoiR+a0wACpZiGuD7drDaTlVho0cQYRdagTasNFfGXi/Kfgn+bzJTGoEM0YrmWYBuGeznxlVc="
        );
    }

    #[test]
    fn test_encode_22_known_vector() {
        let wire = encode_message_at(NUDGE_22, &zero_key(), ProtocolVersion::V22, at_millis(1_700_000_000_500));
        assert_eq!(&wire[..3], b"2.2");
        assert_eq!(hex::encode(&wire[3..7]), "7556b037");
        assert_eq!(&wire[7..15], b"00000050");
        assert_eq!(
            hex::encode(&wire),
            "322e327556b0373030303030303530b798a708c0c7a5c24a429c5f39ed916d4877c87806064ac1664128891f9ad30002a59886b83eddac3693955868d1c41868b8defeb6b5df481b74f75a079de677a5fb7a7d0333cdd9fb1ba6b3201c9b74dd83849764bf642c40bd6aa29700ec08"
        );
    }

    #[test]
    fn test_message_timestamp_wraps_to_eight_digits() {
        assert_eq!(message_timestamp(at_millis(1_700_000_000_500)), "00000050");
        assert_eq!(message_timestamp(at_millis(1_712_345_678_912)), "34567891");
    }

    #[test]
    fn test_decode_both_versions() {
        let key = zero_key();
        let decoded = decode_message(&encode_message(NUDGE_21, &key, ProtocolVersion::V21), &key).unwrap();
        assert_eq!(decoded.version, ProtocolVersion::V21);
        assert_eq!(decoded.timestamp, None);
        assert_eq!(decoded.plaintext, NUDGE_21);

        let wire = encode_message_at(NUDGE_22, &key, ProtocolVersion::V22, at_millis(1_700_000_000_500));
        let decoded = decode_message(&wire, &key).unwrap();
        assert_eq!(decoded.version, ProtocolVersion::V22);
        assert_eq!(decoded.timestamp.as_deref(), Some("00000050"));
        assert_eq!(decoded.plaintext, NUDGE_22);
    }

    #[test]
    fn test_decode_rejects_tampering() {
        let key = zero_key();
        let mut wire = encode_message(NUDGE_21, &key, ProtocolVersion::V21);
        wire[5] = if wire[5] == b'0' { b'1' } else { b'0' };
        assert!(matches!(decode_message(&wire, &key), Err(FlashError::MalformedMessage(_))));

        let mut wire = encode_message(NUDGE_22, &key, ProtocolVersion::V22);
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        assert!(matches!(decode_message(&wire, &key), Err(FlashError::MalformedMessage(_))));

        assert!(decode_message(b"3.3whatever", &key).is_err());
        assert!(decode_message(b"2.", &key).is_err());
    }

    #[test]
    fn test_response_signature_known_vector() {
        assert_eq!(response_signature("abc", 1_700_000_000, &zero_key()), "9b80ce382fa1ee48");
    }

    #[test]
    fn test_encrypted_null_result() {
        let response = encrypted_response(&Value::Null, 1_700_000_000, &zero_key()).unwrap();
        assert_eq!(
            serde_json::to_string(&response).unwrap(),
            r#"{"result":"JqgC3KcL+PhFfrJ6QVst1rNDkqEAeE5clSV8x0UiEa6FXmAf4muUZeCPnR1XSN8u","t":1700000000,"sign":"2f175a4208af2a98"}"#
        );
        let inner = open_encrypted_response(&response, &zero_key()).unwrap();
        assert_eq!(inner, json!({"result": null, "t": 1700000000, "success": true}));
    }

    #[test]
    fn test_plain_response_omits_falsy_result() {
        assert_eq!(
            serde_json::to_string(&plain_response(&Value::Null, 5)).unwrap(),
            r#"{"t":5,"e":false,"success":true}"#
        );
        assert!(plain_response(&json!(false), 5).get("result").is_none());
        assert!(plain_response(&json!({}), 5).get("result").is_none());
        assert_eq!(plain_response(&json!(true), 5)["result"], json!(true));
        assert_eq!(
            serde_json::to_string(&plain_response(&json!({"a": 1}), 5)).unwrap(),
            r#"{"t":5,"e":false,"success":true,"result":{"a":1}}"#
        );
    }

    #[test]
    fn test_request_payload_decoding() {
        let key = zero_key();
        let body = encode_request_payload(r#"{"token":"x"}"#, &key);
        assert!(matches!(decode_request_payload(&body, &key), RequestPayload::Json(ref s) if s == r#"{"token":"x"}"#));

        assert!(matches!(decode_request_payload(b"", &key), RequestPayload::Empty));
        assert!(matches!(decode_request_payload(b"data=", &key), RequestPayload::Empty));

        match decode_request_payload(b"data=zz-not-hex", &key) {
            RequestPayload::Raw { text, error } => {
                assert_eq!(text, "zz-not-hex");
                assert!(matches!(error, FlashError::MalformedMessage(_)));
            }
            other => panic!("expected raw payload, got {other:?}"),
        }

        // Decrypts fine but is not JSON
        let body = encode_request_payload("hello", &key);
        assert!(matches!(decode_request_payload(&body, &key), RequestPayload::Raw { .. }));
    }

    #[test]
    fn test_version_parsing() {
        assert_eq!("2.1".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::V21);
        assert_eq!(ProtocolVersion::for_encrypted(true).to_string(), "2.2");
        assert!("2.3".parse::<ProtocolVersion>().is_err());
    }
}
