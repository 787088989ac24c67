//! Home Assistant MQTT discovery payloads.
//!
//! On startup the bridge publishes one retained config message per entity
//! under `<discovery_prefix>/{cover|sensor|binary_sensor}/<mac>/<slot>/config`
//! so the controller materializes the cover and its diagnostic sensors
//! without manual configuration. Every entity names the device availability
//! topic, so entities flip unavailable together when the blind drops off.

use serde::Serialize;

use bt2mqtt_types::{MAX_ANGLE, MIN_ANGLE, MacAddress};

use crate::bridge::DeviceTopics;

/// Manufacturer reported in the discovery device block.
const MANUFACTURER: &str = "MySmartBlinds";

/// Model reported in the discovery device block.
const MODEL: &str = "Smart Blind";

/// Availability topic reference.
#[derive(Debug, Clone, Serialize)]
pub struct AvailabilityRef {
    /// The availability topic.
    pub topic: String,
}

/// The `device` block shared by every entity of one blind.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceBlock {
    /// Bluetooth connection identity.
    pub connections: Vec<[String; 2]>,
    /// Stable identifiers for entity grouping.
    pub identifiers: Vec<String>,
    /// Hardware manufacturer.
    pub manufacturer: String,
    /// Hardware model.
    pub model: String,
    /// Configured friendly name.
    pub name: String,
    /// Firmware version, when the device reported one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<String>,
}

impl DeviceBlock {
    /// Build the device block for one blind.
    pub fn new(name: &str, mac: MacAddress, sw_version: Option<String>) -> Self {
        Self {
            connections: vec![["mac".to_string(), mac.to_string()]],
            identifiers: vec![format!("bt2mqtt_{}", mac.topic_segment())],
            manufacturer: MANUFACTURER.to_string(),
            model: MODEL.to_string(),
            name: name.to_string(),
            sw_version,
        }
    }
}

/// Discovery config for the cover entity.
#[derive(Debug, Clone, Serialize)]
pub struct CoverConfig {
    /// Availability topics.
    pub availability: Vec<AvailabilityRef>,
    /// Device block.
    pub device: DeviceBlock,
    /// Entity name.
    pub name: String,
    /// Stable unique id.
    pub unique_id: String,
    /// Entity class.
    pub device_class: String,
    /// OPEN/CLOSE command topic.
    pub command_topic: String,
    /// open/closed state topic.
    pub state_topic: String,
    /// Tilt command topic.
    pub tilt_command_topic: String,
    /// Tilt state topic.
    pub tilt_status_topic: String,
    /// Minimum tilt value.
    pub tilt_min: u8,
    /// Maximum tilt value.
    pub tilt_max: u8,
    /// Tilt value that counts as fully open.
    pub tilt_opened_value: u8,
    /// Tilt value that counts as fully closed.
    pub tilt_closed_value: u8,
    /// Open command payload.
    pub payload_open: String,
    /// Close command payload.
    pub payload_close: String,
}

/// Discovery config for a diagnostic sensor.
#[derive(Debug, Clone, Serialize)]
pub struct SensorConfig {
    /// Availability topics.
    pub availability: Vec<AvailabilityRef>,
    /// Device block.
    pub device: DeviceBlock,
    /// Entity name.
    pub name: String,
    /// Stable unique id.
    pub unique_id: String,
    /// State topic.
    pub state_topic: String,
    /// Unit of the extracted value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
    /// Entity class.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    /// Statistics class.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_class: Option<String>,
    /// Template extracting the value from the JSON state payload.
    pub value_template: String,
}

/// Discovery config for a diagnostic binary sensor.
#[derive(Debug, Clone, Serialize)]
pub struct BinarySensorConfig {
    /// Availability topics.
    pub availability: Vec<AvailabilityRef>,
    /// Device block.
    pub device: DeviceBlock,
    /// Entity name.
    pub name: String,
    /// Stable unique id.
    pub unique_id: String,
    /// State topic.
    pub state_topic: String,
    /// Entity class.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    /// ON payload after templating.
    pub payload_on: String,
    /// OFF payload after templating.
    pub payload_off: String,
    /// Template mapping the JSON state payload to ON/OFF.
    pub value_template: String,
}

struct SensorSpec {
    slot: &'static str,
    label: &'static str,
    unit: Option<&'static str>,
    device_class: Option<&'static str>,
    state_class: Option<&'static str>,
    value_template: &'static str,
}

const SENSORS: [SensorSpec; 5] = [
    SensorSpec {
        slot: "battery",
        label: "Battery",
        unit: Some("%"),
        device_class: Some("battery"),
        state_class: Some("measurement"),
        value_template: "{{ value_json.percentage }}",
    },
    SensorSpec {
        slot: "illuminance",
        label: "Illuminance",
        unit: Some("lx"),
        device_class: Some("illuminance"),
        state_class: Some("measurement"),
        value_template: "{{ value_json.lux }}",
    },
    SensorSpec {
        slot: "interior_temperature",
        label: "Interior temperature",
        unit: Some("°C"),
        device_class: Some("temperature"),
        state_class: Some("measurement"),
        value_template: "{{ value_json.celsius }}",
    },
    SensorSpec {
        slot: "solar_panel",
        label: "Solar panel voltage",
        unit: Some("mV"),
        device_class: Some("voltage"),
        state_class: Some("measurement"),
        value_template: "{{ value_json.voltage_mv }}",
    },
    SensorSpec {
        slot: "rssi",
        label: "Signal strength",
        unit: Some("dBm"),
        device_class: Some("signal_strength"),
        state_class: Some("measurement"),
        value_template: "{{ value_json.dbm }}",
    },
];

struct BinarySensorSpec {
    slot: &'static str,
    label: &'static str,
    device_class: Option<&'static str>,
    value_template: &'static str,
}

const BINARY_SENSORS: [BinarySensorSpec; 3] = [
    BinarySensorSpec {
        slot: "charging",
        label: "Charging",
        device_class: Some("battery_charging"),
        value_template: "{{ 'ON' if value_json.solar or value_json.usb else 'OFF' }}",
    },
    BinarySensorSpec {
        slot: "is_over_temperature",
        label: "Over temperature",
        device_class: Some("problem"),
        value_template: "{{ 'ON' if value_json.active else 'OFF' }}",
    },
    BinarySensorSpec {
        slot: "is_under_voltage_lockout",
        label: "Under-voltage lockout",
        device_class: Some("problem"),
        value_template: "{{ 'ON' if value_json.active else 'OFF' }}",
    },
];

/// Build every retained discovery message for one blind.
///
/// Returns `(topic, json payload)` pairs: the cover entity plus each
/// diagnostic sensor and binary sensor.
pub fn discovery_messages(
    discovery_prefix: &str,
    blind_name: &str,
    mac: MacAddress,
    sw_version: Option<String>,
    topics: &DeviceTopics,
) -> Vec<(String, String)> {
    let mac_segment = mac.topic_segment();
    let device = DeviceBlock::new(blind_name, mac, sw_version);
    let availability = vec![AvailabilityRef {
        topic: topics.availability(),
    }];
    let unique = |slot: &str| format!("bt2mqtt_{mac_segment}_{slot}");

    let mut messages = Vec::new();

    let cover = CoverConfig {
        availability: availability.clone(),
        device: device.clone(),
        name: blind_name.to_string(),
        unique_id: unique("cover"),
        device_class: "blind".to_string(),
        command_topic: topics.set(),
        state_topic: topics.state(),
        tilt_command_topic: topics.tilt_set(),
        tilt_status_topic: topics.tilt_state(),
        tilt_min: MIN_ANGLE,
        tilt_max: MAX_ANGLE,
        tilt_opened_value: MAX_ANGLE / 2,
        tilt_closed_value: MIN_ANGLE,
        payload_open: "OPEN".to_string(),
        payload_close: "CLOSE".to_string(),
    };
    messages.push((
        format!("{discovery_prefix}/cover/{mac_segment}/cover/config"),
        serialize(&cover),
    ));

    for spec in &SENSORS {
        let sensor = SensorConfig {
            availability: availability.clone(),
            device: device.clone(),
            name: format!("{blind_name} {}", spec.label),
            unique_id: unique(spec.slot),
            state_topic: topics.metric_state(spec.slot),
            unit_of_measurement: spec.unit.map(str::to_string),
            device_class: spec.device_class.map(str::to_string),
            state_class: spec.state_class.map(str::to_string),
            value_template: spec.value_template.to_string(),
        };
        messages.push((
            format!("{discovery_prefix}/sensor/{mac_segment}/{}/config", spec.slot),
            serialize(&sensor),
        ));
    }

    for spec in &BINARY_SENSORS {
        let sensor = BinarySensorConfig {
            availability: availability.clone(),
            device: device.clone(),
            name: format!("{blind_name} {}", spec.label),
            unique_id: unique(spec.slot),
            state_topic: topics.metric_state(spec.slot),
            device_class: spec.device_class.map(str::to_string),
            payload_on: "ON".to_string(),
            payload_off: "OFF".to_string(),
            value_template: spec.value_template.to_string(),
        };
        messages.push((
            format!(
                "{discovery_prefix}/binary_sensor/{mac_segment}/{}/config",
                spec.slot
            ),
            serialize(&sensor),
        ));
    }

    messages
}

fn serialize<T: Serialize>(payload: &T) -> String {
    serde_json::to_string(payload).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn messages() -> Vec<(String, String)> {
        let mac: MacAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let topics = DeviceTopics::new(mac);
        discovery_messages(
            "homeassistant",
            "Living room",
            mac,
            Some("2.1.0".to_string()),
            &topics,
        )
    }

    #[test]
    fn test_one_message_per_entity() {
        let messages = messages();
        // 1 cover + 5 sensors + 3 binary sensors.
        assert_eq!(messages.len(), 9);
    }

    #[test]
    fn test_cover_config_shape() {
        let messages = messages();
        let (topic, payload) = &messages[0];
        assert_eq!(topic, "homeassistant/cover/AA_BB_CC_DD_EE_FF/cover/config");

        let json: serde_json::Value = serde_json::from_str(payload).unwrap();
        assert_eq!(json["name"], "Living room");
        assert_eq!(json["device_class"], "blind");
        assert_eq!(json["command_topic"], "bt2mqtt/cover/AA_BB_CC_DD_EE_FF/set");
        assert_eq!(
            json["tilt_command_topic"],
            "bt2mqtt/cover/AA_BB_CC_DD_EE_FF/tilt/set"
        );
        assert_eq!(json["tilt_min"], 0);
        assert_eq!(json["tilt_max"], 200);
        assert_eq!(json["tilt_opened_value"], 100);
        assert_eq!(
            json["availability"][0]["topic"],
            "bt2mqtt/cover/AA_BB_CC_DD_EE_FF/availability"
        );
        assert_eq!(json["device"]["manufacturer"], "MySmartBlinds");
        assert_eq!(json["device"]["sw_version"], "2.1.0");
        assert_eq!(json["device"]["connections"][0][0], "mac");
        assert_eq!(json["device"]["connections"][0][1], "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_battery_sensor_shape() {
        let messages = messages();
        let (topic, payload) = messages
            .iter()
            .find(|(t, _)| t.contains("/sensor/") && t.contains("battery"))
            .unwrap();
        assert_eq!(topic, "homeassistant/sensor/AA_BB_CC_DD_EE_FF/battery/config");

        let json: serde_json::Value = serde_json::from_str(payload).unwrap();
        assert_eq!(json["device_class"], "battery");
        assert_eq!(json["unit_of_measurement"], "%");
        assert_eq!(json["value_template"], "{{ value_json.percentage }}");
        assert_eq!(
            json["state_topic"],
            "bt2mqtt/cover/AA_BB_CC_DD_EE_FF/battery/state"
        );
    }

    #[test]
    fn test_binary_sensor_shape() {
        let messages = messages();
        let (_, payload) = messages
            .iter()
            .find(|(t, _)| t.contains("/binary_sensor/") && t.contains("charging"))
            .unwrap();

        let json: serde_json::Value = serde_json::from_str(payload).unwrap();
        assert_eq!(json["device_class"], "battery_charging");
        assert_eq!(json["payload_on"], "ON");
        assert_eq!(json["payload_off"], "OFF");
    }

    #[test]
    fn test_unique_ids_are_distinct() {
        let messages = messages();
        let mut ids = std::collections::HashSet::new();
        for (_, payload) in &messages {
            let json: serde_json::Value = serde_json::from_str(payload).unwrap();
            assert!(ids.insert(json["unique_id"].as_str().unwrap().to_string()));
        }
    }

    #[test]
    fn test_missing_sw_version_is_omitted() {
        let mac: MacAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let topics = DeviceTopics::new(mac);
        let messages = discovery_messages("homeassistant", "Blind", mac, None, &topics);
        let json: serde_json::Value = serde_json::from_str(&messages[0].1).unwrap();
        assert!(json["device"].get("sw_version").is_none());
    }
}
