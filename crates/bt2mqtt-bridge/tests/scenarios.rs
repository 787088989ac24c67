//! End-to-end scenario tests over the public surface, no hardware needed.
//!
//! Each test follows one of the protocol walkthroughs the bridge is built
//! around: the unlock byte exchange, the wire decodes, and the
//! configuration-to-discovery pipeline.

use bt2mqtt_bridge::bridge::DeviceTopics;
use bt2mqtt_bridge::config::Config;
use bt2mqtt_bridge::discovery::discovery_messages;
use bt2mqtt_types::{CoverState, MacAddress, Passkey, SensorReadings, StatusFlags, snap_angle};

const CONFIG: &str = r#"
mqtt:
  host: broker.local
smart_blinds:
  max_unlock_retries: 3
  blinds:
    - name: Living room
      mac: "AA:BB:CC:DD:EE:FF"
      passkey: "000102030405"
"#;

#[test]
fn unlock_byte_exchange() {
    // A 12-character passkey writes key || 0x01 and expects key || 0x00 back.
    let config: Config = serde_yaml::from_str(CONFIG).unwrap();
    let (_, passkey) = config.smart_blinds.blinds[0].resolve().unwrap();

    assert_eq!(
        passkey.unlock_payload(),
        vec![0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x01]
    );
    assert!(passkey.matches_echo(&[0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x00]));
    assert!(!passkey.matches_echo(&[0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x01]));
}

#[test]
fn status_word_decode() {
    // 0x80020001 little-endian: reversed, solar present, passkey valid.
    let flags = StatusFlags::from_bytes(&[0x01, 0x00, 0x02, 0x80]).unwrap();
    assert!(flags.is_reversed);
    assert!(!flags.is_bonding);
    assert!(flags.has_solar);
    assert!(flags.is_passkey_valid);
    assert!(!flags.is_solar_charging);
    assert!(!flags.is_usb_charging);
    assert!(!flags.is_calibrated);
}

#[test]
fn sensor_payload_decode() {
    let readings = SensorReadings::from_bytes(&[
        0x55, 0x00, 0xC4, 0x0E, 0x00, 0x00, 0x00, 0x00, 0xE0, 0x00, 0xD4, 0x00, 0x32, 0x00,
    ])
    .unwrap();
    assert_eq!(readings.battery_percentage, 85);
    assert_eq!(readings.battery_voltage, 3780);
    assert_eq!(readings.battery_charge, 0);
    assert_eq!(readings.solar_panel_voltage, 0);
    assert!((readings.interior_temperature - 22.4).abs() < 0.01);
    assert!((readings.battery_temperature - 21.2).abs() < 0.01);
    assert!((readings.illuminance - 5.0).abs() < 0.01);
}

#[test]
fn angle_projection_matches_cover_semantics() {
    // OPEN maps to the tilt midpoint, CLOSE to zero; both ends read closed.
    assert_eq!(CoverState::from_angle(100).payload(), "open");
    assert_eq!(CoverState::from_angle(0).payload(), "closed");
    assert_eq!(CoverState::from_angle(200).payload(), "closed");
    assert_eq!(snap_angle(7), 0);
    assert_eq!(snap_angle(194), 200);
}

#[test]
fn config_to_discovery_pipeline() {
    let config: Config = serde_yaml::from_str(CONFIG).unwrap();
    config.validate().unwrap();

    let entry = &config.smart_blinds.blinds[0];
    let (mac, _) = entry.resolve().unwrap();
    let topics = DeviceTopics::new(mac);
    let messages = discovery_messages(
        &config.homeassistant.discovery_prefix,
        &entry.name,
        mac,
        None,
        &topics,
    );

    // Cover plus diagnostic sensors, all pointing at the device topics.
    assert_eq!(messages.len(), 9);
    for (topic, payload) in &messages {
        assert!(topic.starts_with("homeassistant/"));
        assert!(topic.ends_with("/config"));
        let json: serde_json::Value = serde_json::from_str(payload).unwrap();
        assert_eq!(
            json["availability"][0]["topic"],
            "bt2mqtt/cover/AA_BB_CC_DD_EE_FF/availability"
        );
        assert_eq!(json["device"]["name"], "Living room");
    }
}

#[test]
fn encoded_config_round_trip() {
    // The vendor app exports base64 of reversed MAC bytes and raw key bytes.
    let yaml = r#"
mqtt:
  host: broker.local
smart_blinds:
  blinds:
    - name: Encoded blind
      encoded_mac: "/+7dzLuq"
      encoded_passkey: "AAECAwQF"
"#;
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    let (mac, passkey) = config.smart_blinds.blinds[0].resolve().unwrap();
    assert_eq!(mac, "AA:BB:CC:DD:EE:FF".parse::<MacAddress>().unwrap());
    assert_eq!(passkey, Passkey::new("000102030405").unwrap());
}
