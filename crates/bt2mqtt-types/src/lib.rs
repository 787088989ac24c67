//! Platform-agnostic types for the bt2mqtt smart-blind bridge.
//!
//! This crate provides the shared protocol types used by the BLE session
//! layer (bt2mqtt-core) and the MQTT bridge (bt2mqtt-bridge):
//!
//! - MAC address parsing, BlueZ object-path mapping, and the vendor's
//!   base64 "encoded" representation
//! - Passkey handling for the unlock handshake
//! - UUID constants for the vendor GATT characteristics
//! - Status bitfield and sensor payload decoding
//! - Error types for data parsing
//!
//! Everything here is pure data: no I/O and no async.

pub mod angle;
pub mod error;
pub mod mac;
pub mod passkey;
pub mod sensors;
pub mod status;
pub mod uuid;

pub use angle::{CoverState, MAX_ANGLE, MIN_ANGLE, snap_angle, validate_angle};
pub use error::{ParseError, ParseResult};
pub use mac::MacAddress;
pub use passkey::Passkey;
pub use sensors::SensorReadings;
pub use status::StatusFlags;
pub use uuid::CharacteristicSlot;
