use std::io;
use thiserror::Error;

/// The primary error type for the `vtrust-lib` library.
#[derive(Error, Debug)]
pub enum FlashError {
    #[error("AES-128 key must be exactly 16 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("Ciphertext length {0} is not a multiple of 16 bytes")]
    InvalidCiphertextLength(usize),

    #[error("Decryption failed: {0}")]
    DecryptionFailure(String),

    #[error("Malformed protocol message: {0}")]
    MalformedMessage(String),

    #[error("Smartconfig payload of {0} bytes does not fit the one-byte length field")]
    PayloadTooLong(usize),

    #[error("PSK handshake failed: {0}")]
    Handshake(String),

    #[error("Session I/O error: {0}")]
    SessionIo(io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MQTT error: {0}")]
    Mqtt(String),

    #[error("Firmware artifact {path}: {source}")]
    Firmware { path: String, source: io::Error },

    #[error("TLS setup error: {0}")]
    Tls(#[from] openssl::error::ErrorStack),
}

impl From<hex::FromHexError> for FlashError {
    fn from(err: hex::FromHexError) -> Self {
        FlashError::MalformedMessage(format!("bad hex: {err}"))
    }
}

impl From<base64::DecodeError> for FlashError {
    fn from(err: base64::DecodeError) -> Self {
        FlashError::MalformedMessage(format!("bad base64: {err}"))
    }
}

impl From<rumqttc::ClientError> for FlashError {
    fn from(err: rumqttc::ClientError) -> Self {
        FlashError::Mqtt(err.to_string())
    }
}

impl From<rumqttc::ConnectionError> for FlashError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        FlashError::Mqtt(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FlashError>;
