pub mod action;
pub mod config;
pub mod constants;
pub mod crc;
pub mod crypto;
pub mod discovery;
pub mod envelope;
pub mod error;
pub mod firmware;
pub mod gateway;
pub mod http;
pub mod logging;
pub mod proxy;
pub mod psk;
pub mod smartconfig;
pub mod trigger;

// Re-export the pieces most binaries need
pub use crypto::SymmetricKey;
pub use error::{FlashError, Result};
pub use gateway::{GatewayConfig, GatewayService};
