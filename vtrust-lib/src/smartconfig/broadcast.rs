//! Broadcast leg of smartconfig: credentials encoded as UDP packet lengths
//!
//! The device can't decrypt the Wi-Fi traffic yet, but it can see the length
//! of every broadcast frame. Each value produced here is the length of one
//! zero-filled datagram.

use crate::constants::{
    BROADCAST_HEAD, CRC_HIGH_NIBBLE_MARKER, CRC_LOW_NIBBLE_MARKER, DATA_BYTE_MARKER, GROUP_CRC_MASK,
    LENGTH_HIGH_NIBBLE_MARKER, LENGTH_LOW_NIBBLE_MARKER, SEQUENCE_MARKER,
};
use crate::crc::crc8;
use crate::error::{FlashError, Result};

const GROUP_SIZE: usize = 4;

/// Fixed preamble sent before the body
pub fn head() -> &'static [u16] {
    &BROADCAST_HEAD
}

/// Raw payload `[pw_len, pw.., token_len, token.., ssid..]`
fn raw_payload(password: &[u8], ssid: &[u8], token_group: &[u8]) -> Result<Vec<u8>> {
    let mut raw = Vec::with_capacity(2 + password.len() + token_group.len() + ssid.len());
    raw.push(field_len(password)?);
    raw.extend_from_slice(password);
    raw.push(field_len(token_group)?);
    raw.extend_from_slice(token_group);
    raw.extend_from_slice(ssid);
    if raw.len() > u8::MAX as usize {
        return Err(FlashError::PayloadTooLong(raw.len()));
    }
    Ok(raw)
}

fn field_len(field: &[u8]) -> Result<u8> {
    u8::try_from(field.len()).map_err(|_| FlashError::PayloadTooLong(field.len()))
}

/// Encode the broadcast body
///
/// Layout: length and CRC-8 of the length as four marked nibbles, then for
/// every 4-byte group a masked CRC-8 of `[seq, group.., zero pad]`, the
/// sequence number and the group's data values. The body ends with one
/// `0x100` marker per byte of the final group.
///
/// # Errors
/// `PayloadTooLong` when the raw payload does not fit in one length byte.
pub fn encode_body(password: &[u8], ssid: &[u8], token_group: &[u8]) -> Result<Vec<u16>> {
    let raw = raw_payload(password, ssid, token_group)?;
    let length = raw.len() as u8;
    let length_crc = crc8(&[length]);

    let mut out = Vec::with_capacity(4 + raw.len() * 2);
    out.push(u16::from(length >> 4) | LENGTH_HIGH_NIBBLE_MARKER);
    out.push(u16::from(length & 0x0F) | LENGTH_LOW_NIBBLE_MARKER);
    out.push(u16::from(length_crc >> 4) | CRC_HIGH_NIBBLE_MARKER);
    out.push(u16::from(length_crc & 0x0F) | CRC_LOW_NIBBLE_MARKER);

    let mut last_group_len = 0;
    for (sequence, group) in raw.chunks(GROUP_SIZE).enumerate() {
        let sequence = sequence as u8;

        let mut checked = [0u8; GROUP_SIZE + 1];
        checked[0] = sequence;
        checked[1..=group.len()].copy_from_slice(group);

        out.push(u16::from(crc8(&checked) & GROUP_CRC_MASK) | SEQUENCE_MARKER);
        out.push(u16::from(sequence) | SEQUENCE_MARKER);
        out.extend(group.iter().map(|&b| u16::from(b) | DATA_BYTE_MARKER));
        last_group_len = group.len();
    }

    out.extend(std::iter::repeat_n(DATA_BYTE_MARKER, last_group_len));
    Ok(out)
}
