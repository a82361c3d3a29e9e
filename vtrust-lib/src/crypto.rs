//! AES-128 envelope used by every encrypted Tuya message
//!
//! Devices encrypt with AES-128-ECB and PKCS#7 padding. There is no IV and no
//! MAC: the same plaintext always yields the same ciphertext and tampering is
//! not detected. Callers must not treat a successful decrypt as proof of
//! authenticity.
//!
//! # Keys
//!
//! - Cloud API (`secKey`): configured, `0000000000000000` by default
//! - MQTT (`localKey`): configured, `0000000000000000` by default
//! - Smartconfig password section: `a3c6794oiu876t54`
//! - LAN discovery: MD5 of `yGAdlopoPVldABfn`

use std::fmt;
use std::str::FromStr;

use aes::Aes128;
use aes::cipher::block_padding::{NoPadding, Pkcs7};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use md5::{Digest, Md5};

use crate::error::{FlashError, Result};

type Aes128EcbEnc = ecb::Encryptor<Aes128>;
type Aes128EcbDec = ecb::Decryptor<Aes128>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// A validated 16-byte AES-128 key
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; BLOCK_SIZE]);

impl SymmetricKey {
    /// Validate a key; anything but 16 bytes is rejected
    pub fn new(bytes: &[u8]) -> Result<Self> {
        let key: [u8; BLOCK_SIZE] = bytes
            .try_into()
            .map_err(|_| FlashError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(key))
    }

    /// Key equal to the MD5 digest of `data`
    pub fn md5_of(data: &[u8]) -> Self {
        Self(md5_digest(data))
    }

    pub fn as_bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.0
    }

    /// Text form of the key, as it appears inside signature strings
    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl From<[u8; BLOCK_SIZE]> for SymmetricKey {
    fn from(bytes: [u8; BLOCK_SIZE]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for SymmetricKey {
    type Error = FlashError;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        Self::new(bytes)
    }
}

impl FromStr for SymmetricKey {
    type Err = FlashError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s.as_bytes())
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymmetricKey({})", hex::encode(self.0))
    }
}

/// Encrypt with AES-128-ECB and PKCS#7 padding
///
/// A block-aligned plaintext gets a full extra block of `0x10` bytes, so the
/// output is always `plaintext.len() / 16 * 16 + 16` bytes long.
///
/// # Errors
/// `InvalidKeyLength` if `key` is not 16 bytes.
pub fn encrypt(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    let key = SymmetricKey::new(key)?;
    Ok(encrypt_with(plaintext, &key))
}

/// Encrypt with an already validated key
pub fn encrypt_with(plaintext: &[u8], key: &SymmetricKey) -> Vec<u8> {
    Aes128EcbEnc::new(key.as_bytes().into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Decrypt AES-128-ECB and strip PKCS#7 padding
///
/// # Errors
/// - `InvalidKeyLength` if `key` is not 16 bytes
/// - `InvalidCiphertextLength` if the input is not block aligned
/// - `DecryptionFailure` if the padding is invalid
pub fn decrypt_bytes(ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    let key = SymmetricKey::new(key)?;
    decrypt_bytes_with(ciphertext, &key)
}

/// Decrypt with an already validated key
pub fn decrypt_bytes_with(ciphertext: &[u8], key: &SymmetricKey) -> Result<Vec<u8>> {
    if !ciphertext.len().is_multiple_of(BLOCK_SIZE) {
        return Err(FlashError::InvalidCiphertextLength(ciphertext.len()));
    }
    Aes128EcbDec::new(key.as_bytes().into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| FlashError::DecryptionFailure("invalid PKCS#7 padding".to_string()))
}

/// Decrypt to a UTF-8 string
///
/// Same as [`decrypt_bytes`], and additionally fails with `DecryptionFailure`
/// when the plaintext is not valid UTF-8.
pub fn decrypt(ciphertext: &[u8], key: &[u8]) -> Result<String> {
    let key = SymmetricKey::new(key)?;
    decrypt_with(ciphertext, &key)
}

/// Decrypt to a UTF-8 string with an already validated key
pub fn decrypt_with(ciphertext: &[u8], key: &SymmetricKey) -> Result<String> {
    let plaintext = decrypt_bytes_with(ciphertext, key)?;
    String::from_utf8(plaintext)
        .map_err(|e| FlashError::DecryptionFailure(format!("plaintext is not UTF-8: {e}")))
}

/// AES-128-CBC over whole blocks, no padding
///
/// Only used by the PSK derivation, where the input is always 32 bytes.
pub fn cbc_encrypt_blocks(plaintext: &[u8], key: &[u8; BLOCK_SIZE], iv: &[u8; BLOCK_SIZE]) -> Result<Vec<u8>> {
    if plaintext.is_empty() || !plaintext.len().is_multiple_of(BLOCK_SIZE) {
        return Err(FlashError::InvalidCiphertextLength(plaintext.len()));
    }
    Ok(Aes128CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<NoPadding>(plaintext))
}

/// MD5 digest as raw bytes
pub fn md5_digest(data: &[u8]) -> [u8; 16] {
    Md5::digest(data).into()
}

/// MD5 digest as lowercase hex
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(md5_digest(data))
}
