// Protocol constants for the Tuya cloud, PSK and smartconfig emulation

use std::net::Ipv4Addr;
use std::time::Duration;

/// Address of the access point the flashing host serves from
pub const DEFAULT_GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 42, 42, 1);

/// Key handed to devices as `secKey` and used for the encrypted cloud API
pub const DEFAULT_SEC_KEY: &str = "0000000000000000";

/// Key handed to devices as `localKey` and used for MQTT messages
pub const DEFAULT_LOCAL_KEY: &str = "0000000000000000";

// Cloud API

/// Length of the `data=` prefix in front of the hex payload of a request body
pub const REQUEST_PAYLOAD_PREFIX_LEN: usize = 5;

/// Firmware version reported in upgrade offers; must exceed any stock version
pub const UPGRADE_VERSION: &str = "9.0.0";

/// URL path the firmware image is served from
pub const UPGRADE_PATH: &str = "/files/upgrade.bin";

/// Number of schema entries offered on a device's first activation
pub const EXTENDED_SCHEMA_ENTRIES: usize = 20;

/// Number of schema entries offered on repeated activations
pub const MINIMAL_SCHEMA_ENTRIES: usize = 1;

/// Delay between an activation and the MQTT upgrade nudge
pub const UPGRADE_TRIGGER_DELAY: Duration = Duration::from_secs(10);

/// `gwId` reported by devices whose SDK is not the ESP82xx one
pub const NON_ESP_GW_ID: &str = "0";

// MQTT trigger

/// Protocol number of the upgrade nudge message
pub const MQTT_TRIGGER_PROTOCOL: u32 = 15;

/// Fixed sequence number of the upgrade nudge message
pub const MQTT_TRIGGER_SEQUENCE: u64 = 1523715;

/// Topic prefix a device listens on, followed by its `gwId`
pub const MQTT_DEVICE_TOPIC_PREFIX: &str = "smart/device/in/";

pub const MQTT_PORT: u16 = 1883;

// PSK frontend

pub const HTTPS_PORT: u16 = 443;
pub const HTTP_PORT: u16 = 80;
pub const MQTTS_PORT: u16 = 8886;

/// Identity prefix presented by genuine devices (after the framing byte)
pub const PSK_IDENTITY_PREFIX: &[u8; 16] = b"BAohbmd6aG91IFR1";

/// Identity hint advertised to devices; its last 16 bytes key the PSK derivation
pub const PSK_HINT: &[u8] = b"1dHRsc2NjbHltbGx3eWh50000000000000000";

/// OpenSSL name of the only cipher suite devices negotiate
pub const PSK_CIPHER: &str = "PSK-AES128-CBC-SHA256";

/// Size of the derived pre-shared key
pub const PSK_LEN: usize = 32;

/// Read size of one relay step
pub const SESSION_BUFFER_SIZE: usize = 4096;

// Discovery

pub const DISCOVERY_PLAIN_PORT: u16 = 6666;
pub const DISCOVERY_ENCRYPTED_PORT: u16 = 6667;

/// Magic string whose MD5 is the discovery decryption key
pub const DISCOVERY_KEY_MAGIC: &[u8] = b"yGAdlopoPVldABfn";

pub const DISCOVERY_HEADER_SIZE: usize = 20;
pub const DISCOVERY_FOOTER_SIZE: usize = 8;

/// Capability key as spelled by the ESP82xx SDK
pub const ESP_ABILITY_KEY: &str = "ability";

/// Misspelled capability key only found in non-ESP SDKs
pub const NON_ESP_ABILITY_KEY: &str = "ablilty";

// Smartconfig

pub const SMARTCONFIG_BROADCAST_PORT: u16 = 30011;
pub const SMARTCONFIG_MULTICAST_PORT: u16 = 30012;

/// Fixed AES key for the multicast password section
pub const SMARTCONFIG_AES_KEY: &[u8; 16] = b"a3c6794oiu876t54";

pub const BROADCAST_HEAD: [u16; 4] = [1, 3, 6, 10];

pub const LENGTH_HIGH_NIBBLE_MARKER: u16 = 0x10;
pub const LENGTH_LOW_NIBBLE_MARKER: u16 = 0x20;
pub const CRC_HIGH_NIBBLE_MARKER: u16 = 0x30;
pub const CRC_LOW_NIBBLE_MARKER: u16 = 0x40;
pub const SEQUENCE_MARKER: u16 = 0x80;
pub const DATA_BYTE_MARKER: u16 = 0x100;
pub const GROUP_CRC_MASK: u8 = 0x7F;

/// ASCII tag carried by the multicast header
pub const MULTICAST_HEAD_TAG: &[u8; 6] = b"TYST01";

pub const MULTICAST_FIRST_OCTET: u8 = 226;
pub const MULTICAST_HEADER_SEQUENCE: u8 = 120;
pub const MULTICAST_SSID_SEQUENCE: u8 = 64;
pub const MULTICAST_TOKEN_SEQUENCE: u8 = 32;
pub const MULTICAST_PASSWORD_SEQUENCE: u8 = 0;
pub const MULTICAST_TTL: u32 = 1;

pub const HEADER_REPEAT_COUNT: usize = 40;
pub const BODY_REPEAT_COUNT: usize = 10;
pub const PACKET_GAP: Duration = Duration::from_millis(5);

/// Attempts made by the standalone sender before giving up
pub const SMARTCONFIG_ATTEMPTS: usize = 10;
pub const SMARTCONFIG_RETRY_DELAY: Duration = Duration::from_secs(3);
