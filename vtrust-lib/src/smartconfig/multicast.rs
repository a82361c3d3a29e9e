//! Multicast leg of smartconfig: credentials encoded in group addresses
//!
//! Every destination is `226.<seq>.<b1>.<b0>`: two payload bytes per address,
//! little end last, with a per-section sequence number in the second octet.

use std::net::Ipv4Addr;

use byteorder::{ByteOrder, LittleEndian};

use crate::constants::{
    MULTICAST_FIRST_OCTET, MULTICAST_HEAD_TAG, MULTICAST_HEADER_SEQUENCE, MULTICAST_PASSWORD_SEQUENCE,
    MULTICAST_SSID_SEQUENCE, MULTICAST_TOKEN_SEQUENCE, SMARTCONFIG_AES_KEY,
};
use crate::crc::crc32;
use crate::crypto::{SymmetricKey, encrypt_with};
use crate::error::{FlashError, Result};

/// Map byte pairs to group addresses, zero-padding an odd tail
pub fn bytes_to_addrs(data: &[u8], sequence: u8) -> Vec<Ipv4Addr> {
    data.chunks(2)
        .enumerate()
        .map(|(i, pair)| {
            let low = pair[0];
            let high = pair.get(1).copied().unwrap_or(0);
            Ipv4Addr::new(MULTICAST_FIRST_OCTET, sequence.wrapping_add(i as u8), high, low)
        })
        .collect()
}

/// `TYST01` at sequence 120
pub fn head() -> Vec<Ipv4Addr> {
    bytes_to_addrs(MULTICAST_HEAD_TAG, MULTICAST_HEADER_SEQUENCE)
}

fn frame_section(plain_len: usize, crc_source: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    let len = u8::try_from(plain_len).map_err(|_| FlashError::PayloadTooLong(plain_len))?;
    let mut crc = [0u8; 4];
    LittleEndian::write_i32(&mut crc, crc32(crc_source));

    let mut out = Vec::with_capacity(6 + payload.len());
    out.push(len);
    out.push(len);
    out.extend_from_slice(&crc);
    out.extend_from_slice(payload);
    Ok(out)
}

/// `[len, len, crc32 LE, data..]`; `PayloadTooLong` past 255 bytes
pub fn encode_plain(data: &[u8]) -> Result<Vec<u8>> {
    frame_section(data.len(), data, data)
}

/// Same framing as [`encode_plain`], payload encrypted under the fixed key.
/// Length and CRC describe the plaintext.
pub fn encode_password(password: &[u8]) -> Result<Vec<u8>> {
    let key = SymmetricKey::from(*SMARTCONFIG_AES_KEY);
    let ciphertext = encrypt_with(password, &key);
    frame_section(password.len(), password, &ciphertext)
}

/// SSID at 64, password at 0, token group at 32, in that order
pub fn encode_body(password: &[u8], ssid: &[u8], token_group: &[u8]) -> Result<Vec<Ipv4Addr>> {
    let mut out = bytes_to_addrs(&encode_plain(ssid)?, MULTICAST_SSID_SEQUENCE);
    out.extend(bytes_to_addrs(&encode_password(password)?, MULTICAST_PASSWORD_SEQUENCE));
    out.extend(bytes_to_addrs(&encode_plain(token_group)?, MULTICAST_TOKEN_SEQUENCE));
    Ok(out)
}
