//! Blind event system for connection, unlock, and metric notifications.
//!
//! Every [`BlindDevice`](crate::BlindDevice) carries a broadcast dispatcher;
//! the bridge subscribes to project events onto MQTT topics. Sending to a
//! dispatcher with no receivers is a no-op, and a faulty receiver can never
//! propagate an error back to the emitter.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use bt2mqtt_types::{SensorReadings, StatusFlags};

/// Events emitted by a blind device.
///
/// Metric variants are emitted only when the decoded value actually changed;
/// a repeated notification with identical bytes emits nothing.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum BlindEvent {
    /// BLE connection established and characteristics bound.
    Connected,
    /// BLE connection lost or the device was disposed.
    Disconnected,
    /// The passkey handshake completed; the device accepts writes.
    Unlocked,
    /// The passkey handshake gave up after the retry cap.
    UnlockFailed,
    /// The blind angle changed.
    AngleChanged {
        /// Current angle in [0, 200].
        angle: u8,
    },
    /// Battery metrics changed.
    BatteryChanged {
        /// Battery level percentage.
        percentage: u8,
        /// Battery voltage in millivolts.
        voltage: u16,
        /// Battery charge counter.
        charge: u16,
        /// Battery temperature in degrees Celsius.
        temperature: f32,
    },
    /// Interior temperature changed.
    InteriorTemperatureChanged {
        /// Temperature in degrees Celsius.
        celsius: f32,
    },
    /// Ambient illuminance changed.
    IlluminanceChanged {
        /// Illuminance in lux.
        lux: f32,
    },
    /// Solar panel voltage changed.
    SolarPanelChanged {
        /// Panel voltage in millivolts.
        voltage: u16,
    },
    /// Charging source changed.
    ChargingChanged {
        /// Charging from the solar panel.
        solar: bool,
        /// Charging over USB.
        usb: bool,
    },
    /// Over-temperature protection toggled.
    OverTemperatureChanged {
        /// Protection currently active.
        active: bool,
    },
    /// Under-voltage lockout toggled.
    UnderVoltageLockoutChanged {
        /// Lockout currently active.
        active: bool,
    },
    /// The full status word changed.
    StatusChanged {
        /// The decoded status flags.
        flags: StatusFlags,
    },
    /// Connection signal strength changed.
    RssiChanged {
        /// RSSI in dBm.
        rssi: i16,
    },
    /// The device-reported name was read or changed.
    NameChanged {
        /// The new name.
        name: String,
    },
}

/// Compute the metric change events between two sensor payloads.
///
/// This is the comparison half of the two-phase update: the caller collects
/// the returned events, stores `new`, and only then emits, so observers never
/// see partially updated state.
pub fn diff_sensors(old: &SensorReadings, new: &SensorReadings) -> Vec<BlindEvent> {
    let mut events = Vec::new();

    if old.battery_percentage != new.battery_percentage
        || old.battery_voltage != new.battery_voltage
        || old.battery_charge != new.battery_charge
        || old.battery_temperature != new.battery_temperature
    {
        events.push(BlindEvent::BatteryChanged {
            percentage: new.battery_percentage,
            voltage: new.battery_voltage,
            charge: new.battery_charge,
            temperature: new.battery_temperature,
        });
    }
    if old.interior_temperature != new.interior_temperature {
        events.push(BlindEvent::InteriorTemperatureChanged {
            celsius: new.interior_temperature,
        });
    }
    if old.illuminance != new.illuminance {
        events.push(BlindEvent::IlluminanceChanged {
            lux: new.illuminance,
        });
    }
    if old.solar_panel_voltage != new.solar_panel_voltage {
        events.push(BlindEvent::SolarPanelChanged {
            voltage: new.solar_panel_voltage,
        });
    }

    events
}

/// Compute the change events between two status words.
pub fn diff_status(old: &StatusFlags, new: &StatusFlags) -> Vec<BlindEvent> {
    let mut events = Vec::new();

    if old.is_solar_charging != new.is_solar_charging || old.is_usb_charging != new.is_usb_charging
    {
        events.push(BlindEvent::ChargingChanged {
            solar: new.is_solar_charging,
            usb: new.is_usb_charging,
        });
    }
    if old.is_over_temperature != new.is_over_temperature {
        events.push(BlindEvent::OverTemperatureChanged {
            active: new.is_over_temperature,
        });
    }
    if old.is_under_voltage_lockout != new.is_under_voltage_lockout {
        events.push(BlindEvent::UnderVoltageLockoutChanged {
            active: new.is_under_voltage_lockout,
        });
    }
    if old != new {
        events.push(BlindEvent::StatusChanged { flags: *new });
    }

    events
}

/// Sender for blind events.
pub type EventSender = broadcast::Sender<BlindEvent>;

/// Receiver for blind events.
pub type EventReceiver = broadcast::Receiver<BlindEvent>;

/// Event dispatcher for fanning events out to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: BlindEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sensors() -> SensorReadings {
        SensorReadings {
            battery_percentage: 85,
            battery_voltage: 3780,
            battery_charge: 0,
            solar_panel_voltage: 0,
            interior_temperature: 22.4,
            battery_temperature: 21.2,
            illuminance: 5.0,
        }
    }

    #[test]
    fn test_diff_sensors_identical_emits_nothing() {
        let readings = sample_sensors();
        assert!(diff_sensors(&readings, &readings).is_empty());
    }

    #[test]
    fn test_diff_sensors_battery_fields_are_grouped() {
        let old = sample_sensors();
        let mut new = old;
        new.battery_percentage = 84;
        new.battery_voltage = 3700;

        let events = diff_sensors(&old, &new);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            BlindEvent::BatteryChanged {
                percentage: 84,
                voltage: 3700,
                ..
            }
        ));
    }

    #[test]
    fn test_diff_sensors_each_metric() {
        let old = sample_sensors();
        let mut new = old;
        new.interior_temperature = 23.0;
        new.illuminance = 120.0;
        new.solar_panel_voltage = 4100;

        let events = diff_sensors(&old, &new);
        assert_eq!(events.len(), 3);
        assert!(events.contains(&BlindEvent::InteriorTemperatureChanged { celsius: 23.0 }));
        assert!(events.contains(&BlindEvent::IlluminanceChanged { lux: 120.0 }));
        assert!(events.contains(&BlindEvent::SolarPanelChanged { voltage: 4100 }));
    }

    #[test]
    fn test_diff_status_identical_emits_nothing() {
        let flags = StatusFlags::from_bits(0x8002_0001);
        assert!(diff_status(&flags, &flags).is_empty());
    }

    #[test]
    fn test_diff_status_charging_sources_are_grouped() {
        let old = StatusFlags::default();
        let mut new = old;
        new.is_solar_charging = true;

        let events = diff_status(&old, &new);
        assert!(events.contains(&BlindEvent::ChargingChanged {
            solar: true,
            usb: false
        }));
        assert!(events.contains(&BlindEvent::StatusChanged { flags: new }));
    }

    #[test]
    fn test_diff_status_protection_flags() {
        let old = StatusFlags::default();
        let mut new = old;
        new.is_over_temperature = true;
        new.is_under_voltage_lockout = true;

        let events = diff_status(&old, &new);
        assert!(events.contains(&BlindEvent::OverTemperatureChanged { active: true }));
        assert!(events.contains(&BlindEvent::UnderVoltageLockoutChanged { active: true }));
    }

    #[test]
    fn test_diff_status_unpublished_bits_still_mark_status_changed() {
        let old = StatusFlags::default();
        let mut new = old;
        new.is_calibrated = true;

        let events = diff_status(&old, &new);
        assert_eq!(events, vec![BlindEvent::StatusChanged { flags: new }]);
    }

    #[tokio::test]
    async fn test_dispatcher_send_receive() {
        let dispatcher = EventDispatcher::new(10);
        let mut rx = dispatcher.subscribe();

        dispatcher.send(BlindEvent::AngleChanged { angle: 100 });

        let received = rx.recv().await.unwrap();
        assert_eq!(received, BlindEvent::AngleChanged { angle: 100 });
    }

    #[test]
    fn test_dispatcher_send_without_receivers_does_not_panic() {
        let dispatcher = EventDispatcher::new(10);
        dispatcher.send(BlindEvent::Unlocked);
    }

    #[test]
    fn test_event_serialization() {
        let event = BlindEvent::AngleChanged { angle: 42 };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("angle_changed"));
        assert!(json.contains("42"));
    }
}
