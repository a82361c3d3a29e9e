//! Firmware image offered to devices, with the digests the upgrade replies quote

use std::path::Path;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::crypto::{SymmetricKey, md5_hex};
use crate::error::{FlashError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Size and digests of the upgrade image, computed once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareInfo {
    /// Byte length, kept as text because that is how replies carry it
    pub len: String,
    /// Lowercase hex
    pub md5: String,
    /// Uppercase hex
    pub sha256: String,
    /// HMAC-SHA-256 keyed with `secKey` over the uppercase SHA-256 hex text,
    /// itself uppercase hex
    pub hmac: String,
}

impl FirmwareInfo {
    pub fn from_bytes(image: &[u8], sec_key: &SymmetricKey) -> Result<Self> {
        let sha256 = hex::encode_upper(Sha256::digest(image));

        let mut mac = HmacSha256::new_from_slice(sec_key.as_bytes())
            .map_err(|_| FlashError::InvalidKeyLength(sec_key.as_bytes().len()))?;
        mac.update(sha256.as_bytes());
        let hmac = hex::encode_upper(mac.finalize().into_bytes());

        Ok(Self {
            len: image.len().to_string(),
            md5: md5_hex(image),
            sha256,
            hmac,
        })
    }

    pub async fn load(path: impl AsRef<Path>, sec_key: &SymmetricKey) -> Result<Self> {
        let path = path.as_ref();
        let image = tokio::fs::read(path).await.map_err(|source| FlashError::Firmware {
            path: path.display().to_string(),
            source,
        })?;
        let info = Self::from_bytes(&image, sec_key)?;
        info!(path = %path.display(), size = %info.len, md5 = %info.md5, "Loaded firmware image");
        Ok(info)
    }
}
