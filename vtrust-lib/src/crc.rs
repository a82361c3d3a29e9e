//! Checksums used by the smartconfig encoders
//!
//! The 8-bit CRC is the reflected 0x31 polynomial (CRC-8/MAXIM) computed one
//! bit at a time, starting from zero with no final XOR. The 32-bit CRC is the
//! usual IEEE one, reported as a signed value because that is how the device
//! firmware reads it back out of the packet.

/// Advance the CRC-8 register by one input byte that has already been XORed in
fn crc8_step(mut value: u8) -> u8 {
    let mut crc: u8 = 0;
    for _ in 0..8 {
        if (crc ^ value) & 1 != 0 {
            crc ^= 0x18;
            crc >>= 1;
            crc |= 0x80;
        } else {
            crc >>= 1;
        }
        value >>= 1;
    }
    crc
}

/// CRC-8 of a byte sequence; the empty sequence yields 0
pub fn crc8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |crc, &b| crc8_step(crc ^ b))
}

/// CRC-32 (IEEE) of a byte sequence as a signed 32-bit value
pub fn crc32(data: &[u8]) -> i32 {
    crc32fast::hash(data) as i32
}

/// CRC-32 (IEEE) as the unsigned bit pattern
pub fn crc32_unsigned(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}
