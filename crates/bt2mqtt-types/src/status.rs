//! Status bitfield decoding.
//!
//! The Status characteristic delivers a 32-bit little-endian word; each
//! defined bit maps to one boolean below.

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Motor direction is reversed.
pub const STATUS_REVERSED: u32 = 0x0000_0001;
/// Device is in bonding mode.
pub const STATUS_BONDING: u32 = 0x0000_0002;
/// Motor travel has been calibrated.
pub const STATUS_CALIBRATED: u32 = 0x0001_0000;
/// A solar panel is attached.
pub const STATUS_HAS_SOLAR: u32 = 0x0002_0000;
/// Battery is charging from the solar panel.
pub const STATUS_SOLAR_CHARGING: u32 = 0x0004_0000;
/// Battery is charging over USB.
pub const STATUS_USB_CHARGING: u32 = 0x0008_0000;
/// The device clock has been synchronized.
pub const STATUS_TIME_VALID: u32 = 0x0010_0000;
/// Motor is disabled due to low battery voltage.
pub const STATUS_UNDER_VOLTAGE_LOCKOUT: u32 = 0x0020_0000;
/// Motor is disabled due to over-temperature.
pub const STATUS_OVER_TEMPERATURE: u32 = 0x0040_0000;
/// Temperature protection has been manually overridden.
pub const STATUS_TEMP_OVERRIDE: u32 = 0x0080_0000;
/// The stored passkey is valid.
pub const STATUS_PASSKEY_VALID: u32 = 0x8000_0000;

// const STATUS_PAIRED: u32 = 0x0000_0004;
// const STATUS_PASSKEY_INVALID: u32 = 0x4000_0000;

/// Decoded Status characteristic word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusFlags {
    /// Motor direction is reversed.
    pub is_reversed: bool,
    /// Device is in bonding mode.
    pub is_bonding: bool,
    /// Motor travel has been calibrated.
    pub is_calibrated: bool,
    /// A solar panel is attached.
    pub has_solar: bool,
    /// Battery is charging from the solar panel.
    pub is_solar_charging: bool,
    /// Battery is charging over USB.
    pub is_usb_charging: bool,
    /// The device clock has been synchronized.
    pub is_time_valid: bool,
    /// Motor is disabled due to low battery voltage.
    pub is_under_voltage_lockout: bool,
    /// Motor is disabled due to over-temperature.
    pub is_over_temperature: bool,
    /// Temperature protection has been manually overridden.
    pub temp_override: bool,
    /// The stored passkey is valid.
    pub is_passkey_valid: bool,
    /// Always false; the vendor bit assignment is unconfirmed.
    pub is_paired: bool,
    /// Always false; the vendor bit assignment is unconfirmed.
    pub is_passkey_invalid: bool,
}

impl StatusFlags {
    /// Decode a status word.
    pub fn from_bits(bits: u32) -> Self {
        Self {
            is_reversed: bits & STATUS_REVERSED != 0,
            is_bonding: bits & STATUS_BONDING != 0,
            is_calibrated: bits & STATUS_CALIBRATED != 0,
            has_solar: bits & STATUS_HAS_SOLAR != 0,
            is_solar_charging: bits & STATUS_SOLAR_CHARGING != 0,
            is_usb_charging: bits & STATUS_USB_CHARGING != 0,
            is_time_valid: bits & STATUS_TIME_VALID != 0,
            is_under_voltage_lockout: bits & STATUS_UNDER_VOLTAGE_LOCKOUT != 0,
            is_over_temperature: bits & STATUS_OVER_TEMPERATURE != 0,
            temp_override: bits & STATUS_TEMP_OVERRIDE != 0,
            is_passkey_valid: bits & STATUS_PASSKEY_VALID != 0,
            is_paired: false,
            is_passkey_invalid: false,
        }
    }

    /// Re-encode the defined bits of this status word.
    pub fn to_bits(&self) -> u32 {
        let mut bits = 0;
        if self.is_reversed {
            bits |= STATUS_REVERSED;
        }
        if self.is_bonding {
            bits |= STATUS_BONDING;
        }
        if self.is_calibrated {
            bits |= STATUS_CALIBRATED;
        }
        if self.has_solar {
            bits |= STATUS_HAS_SOLAR;
        }
        if self.is_solar_charging {
            bits |= STATUS_SOLAR_CHARGING;
        }
        if self.is_usb_charging {
            bits |= STATUS_USB_CHARGING;
        }
        if self.is_time_valid {
            bits |= STATUS_TIME_VALID;
        }
        if self.is_under_voltage_lockout {
            bits |= STATUS_UNDER_VOLTAGE_LOCKOUT;
        }
        if self.is_over_temperature {
            bits |= STATUS_OVER_TEMPERATURE;
        }
        if self.temp_override {
            bits |= STATUS_TEMP_OVERRIDE;
        }
        if self.is_passkey_valid {
            bits |= STATUS_PASSKEY_VALID;
        }
        bits
    }

    /// Decode a Status notification payload (u32 LE).
    pub fn from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < 4 {
            return Err(ParseError::InsufficientBytes {
                expected: 4,
                actual: data.len(),
            });
        }
        Ok(Self::from_bits(u32::from_le_bytes([
            data[0], data[1], data[2], data[3],
        ])))
    }

    /// Whether the battery is charging from any source.
    pub fn is_charging(&self) -> bool {
        self.is_solar_charging || self.is_usb_charging
    }
}
