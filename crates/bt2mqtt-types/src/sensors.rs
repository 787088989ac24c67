//! Sensor payload decoding.

use bytes::Buf;
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Minimum Sensors characteristic payload size.
pub const MIN_SENSOR_PAYLOAD_BYTES: usize = 14;

/// Decoded Sensors characteristic payload.
///
/// The payload is little-endian:
///
/// - byte 0: battery percentage (u8)
/// - bytes 2-3: battery voltage (u16, mV)
/// - bytes 4-5: battery charge (u16)
/// - bytes 6-7: solar panel voltage (u16, mV)
/// - bytes 8-9: interior temperature × 10 (u16, °C)
/// - bytes 10-11: battery temperature × 10 (u16, °C)
/// - bytes 12-13: illuminance × 10 (u16, lx)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SensorReadings {
    /// Battery level percentage (0-100).
    pub battery_percentage: u8,
    /// Battery voltage in millivolts.
    pub battery_voltage: u16,
    /// Battery charge counter.
    pub battery_charge: u16,
    /// Solar panel voltage in millivolts.
    pub solar_panel_voltage: u16,
    /// Interior temperature in degrees Celsius.
    pub interior_temperature: f32,
    /// Battery temperature in degrees Celsius.
    pub battery_temperature: f32,
    /// Illuminance in lux.
    pub illuminance: f32,
}

impl SensorReadings {
    /// Parse a Sensors notification payload.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < MIN_SENSOR_PAYLOAD_BYTES {
            return Err(ParseError::InsufficientBytes {
                expected: MIN_SENSOR_PAYLOAD_BYTES,
                actual: data.len(),
            });
        }

        let mut buf = data;
        let battery_percentage = buf.get_u8();
        buf.advance(1); // reserved
        let battery_voltage = buf.get_u16_le();
        let battery_charge = buf.get_u16_le();
        let solar_panel_voltage = buf.get_u16_le();
        let interior_raw = buf.get_u16_le();
        let battery_temp_raw = buf.get_u16_le();
        let illuminance_raw = buf.get_u16_le();

        Ok(Self {
            battery_percentage,
            battery_voltage,
            battery_charge,
            solar_panel_voltage,
            interior_temperature: interior_raw as f32 / 10.0,
            battery_temperature: battery_temp_raw as f32 / 10.0,
            illuminance: illuminance_raw as f32 / 10.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_example_payload() {
        let bytes: [u8; 14] = [
            0x55, 0x00, // battery 85%, reserved
            0xC4, 0x0E, // battery voltage 3780 mV
            0x00, 0x00, // battery charge 0
            0x00, 0x00, // solar panel 0 mV
            0xE0, 0x00, // interior 22.4 C
            0xD4, 0x00, // battery temp 21.2 C
            0x32, 0x00, // illuminance 5.0 lx
        ];

        let readings = SensorReadings::from_bytes(&bytes).unwrap();
        assert_eq!(readings.battery_percentage, 85);
        assert_eq!(readings.battery_voltage, 3780);
        assert_eq!(readings.battery_charge, 0);
        assert_eq!(readings.solar_panel_voltage, 0);
        assert!((readings.interior_temperature - 22.4).abs() < 0.01);
        assert!((readings.battery_temperature - 21.2).abs() < 0.01);
        assert!((readings.illuminance - 5.0).abs() < 0.01);
    }

    #[test]
    fn test_longer_payload_is_accepted() {
        let mut bytes = vec![0u8; 20];
        bytes[0] = 42;
        let readings = SensorReadings::from_bytes(&bytes).unwrap();
        assert_eq!(readings.battery_percentage, 42);
    }

    #[test]
    fn test_rejects_short_payload() {
        assert!(matches!(
            SensorReadings::from_bytes(&[0u8; 13]),
            Err(ParseError::InsufficientBytes { expected: 14, actual: 13 })
        ));
    }

    #[test]
    fn test_default_is_all_zero() {
        let readings = SensorReadings::default();
        assert_eq!(readings.battery_percentage, 0);
        assert_eq!(readings.illuminance, 0.0);
    }
}
