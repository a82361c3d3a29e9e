//! TLS-PSK termination for device HTTPS and MQTTS
//!
//! Devices authenticate with a pre-shared key derived from the identity they
//! present and the identity hint the server advertises:
//!
//! ```text
//! id  = identity[1..]
//! key = MD5(hint[-16..])
//! iv  = MD5(id)
//! psk = AES-128-CBC(key, iv).encrypt(id[..32])
//! ```
//!
//! Only TLS 1.2 with `PSK-AES128-CBC-SHA256` is offered, which is all the
//! device firmware speaks.

use std::ffi::{CString, c_char, c_int};
use std::pin::Pin;

use openssl::error::ErrorStack;
use openssl::ssl::{Ssl, SslContext, SslContextBuilder, SslMethod, SslVersion};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_openssl::SslStream;
use tracing::{debug, info, warn};

use crate::constants::{PSK_CIPHER, PSK_IDENTITY_PREFIX, PSK_LEN};
use crate::crypto::{BLOCK_SIZE, cbc_encrypt_blocks, md5_digest};
use crate::error::{FlashError, Result};

unsafe extern "C" {
    fn SSL_CTX_use_psk_identity_hint(ctx: *mut openssl_sys::SSL_CTX, hint: *const c_char) -> c_int;
}

/// Derive the pre-shared key for a presented identity
///
/// # Errors
/// `Handshake` if the hint is shorter than 16 bytes or the identity doesn't
/// leave a whole number of AES blocks to encrypt.
pub fn derive_psk(identity: &[u8], hint: &[u8]) -> Result<Vec<u8>> {
    let id = identity.get(1..).unwrap_or_default();
    if !id.starts_with(PSK_IDENTITY_PREFIX) {
        debug!(prefix = %String::from_utf8_lossy(&id[..id.len().min(16)]), "Unexpected PSK identity prefix");
    }

    let hint_tail = hint
        .len()
        .checked_sub(BLOCK_SIZE)
        .map(|start| &hint[start..])
        .ok_or_else(|| FlashError::Handshake(format!("identity hint is only {} bytes", hint.len())))?;

    let key = md5_digest(hint_tail);
    let iv = md5_digest(id);
    let block = &id[..id.len().min(PSK_LEN)];
    cbc_encrypt_blocks(block, &key, &iv)
        .map_err(|_| FlashError::Handshake(format!("identity of {} bytes cannot key a PSK", identity.len())))
}

/// Handshake failures that come from phones and laptops probing the access
/// point rather than from devices
pub fn is_benign_handshake_error(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    [
        "no shared cipher",
        "no_shared_cipher",
        "wrong version number",
        "wrong_version_number",
        "wrong ssl version",
        "wrong_ssl_version",
    ]
    .iter()
    .any(|needle| message.contains(needle))
}

/// Server-side TLS-PSK context shared by every connection on a port
#[derive(Clone)]
pub struct PskAcceptor {
    context: SslContext,
}

impl PskAcceptor {
    pub fn new(hint: &[u8]) -> Result<Self> {
        let mut builder = SslContextBuilder::new(SslMethod::tls_server())?;
        builder.set_max_proto_version(Some(SslVersion::TLS1_2))?;
        builder.set_cipher_list(PSK_CIPHER)?;

        let c_hint = CString::new(hint)
            .map_err(|_| FlashError::Handshake("identity hint contains a NUL byte".into()))?;
        // SAFETY: the context pointer is valid for the builder's lifetime and
        // OpenSSL copies the hint string.
        let rc = unsafe { SSL_CTX_use_psk_identity_hint(builder.as_ptr(), c_hint.as_ptr()) };
        if rc != 1 {
            return Err(ErrorStack::get().into());
        }

        let hint = hint.to_vec();
        builder.set_psk_server_callback(move |_ssl, identity: Option<&[u8]>, psk_out: &mut [u8]| {
            let Some(identity) = identity else {
                warn!("Client sent no PSK identity");
                return Ok(0);
            };
            debug!(identity = %hex::encode(identity), "PSK identity");
            match derive_psk(identity, &hint) {
                Ok(psk) if psk.len() <= psk_out.len() => {
                    debug!(psk = %hex::encode(&psk), "PSK derived");
                    psk_out[..psk.len()].copy_from_slice(&psk);
                    Ok(psk.len())
                }
                Ok(psk) => {
                    warn!("PSK of {} bytes does not fit in {}", psk.len(), psk_out.len());
                    Ok(0)
                }
                Err(e) => {
                    warn!("{}", e);
                    Ok(0)
                }
            }
        });

        Ok(Self {
            context: builder.build(),
        })
    }

    /// Run the server handshake on an accepted stream
    pub async fn accept<S>(&self, stream: S) -> Result<SslStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ssl = Ssl::new(&self.context)?;
        let mut tls = SslStream::new(ssl, stream)?;
        match Pin::new(&mut tls).accept().await {
            Ok(()) => Ok(tls),
            Err(e) => {
                let message = e.to_string();
                if is_benign_handshake_error(&message) {
                    info!("Could not establish PSK session ({}); probably just a phone", message);
                } else {
                    warn!("Could not establish PSK session: {}", message);
                }
                Err(FlashError::Handshake(message))
            }
        }
    }
}
