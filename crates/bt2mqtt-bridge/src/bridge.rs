//! The bridge controller.
//!
//! Wires each [`BlindDevice`]'s event stream onto its MQTT topic tree and
//! routes inbound command messages back into queued GATT writes. One task
//! per device fans events out; one task routes every inbound publish.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use rumqttc::QoS;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bt2mqtt_core::{BlindConfig, BlindDevice, BlindEvent, SessionManager};
use bt2mqtt_types::{CoverState, MAX_ANGLE, MacAddress, snap_angle};

use crate::config::Config;
use crate::discovery::discovery_messages;
use crate::mqtt::{InboundMessage, MqttClient};

/// Topic prefix for every device topic the bridge owns.
pub const TOPIC_PREFIX: &str = "bt2mqtt";

/// Availability payload for a reachable, unlocked device.
pub const PAYLOAD_ONLINE: &str = "online";

/// Availability payload for an unreachable device.
pub const PAYLOAD_OFFLINE: &str = "offline";

/// The topic tree of one device: `bt2mqtt/cover/<MAC with underscores>/…`.
#[derive(Debug, Clone)]
pub struct DeviceTopics {
    base: String,
}

impl DeviceTopics {
    /// Build the topic tree for a device.
    pub fn new(mac: MacAddress) -> Self {
        Self {
            base: format!("{TOPIC_PREFIX}/cover/{}", mac.topic_segment()),
        }
    }

    /// Retained "online"/"offline" topic.
    pub fn availability(&self) -> String {
        format!("{}/availability", self.base)
    }

    /// "open"/"closed" state topic.
    pub fn state(&self) -> String {
        format!("{}/state", self.base)
    }

    /// Tilt state topic (JSON number).
    pub fn tilt_state(&self) -> String {
        format!("{}/tilt/state", self.base)
    }

    /// Inbound tilt command topic.
    pub fn tilt_set(&self) -> String {
        format!("{}/tilt/set", self.base)
    }

    /// Inbound OPEN/CLOSE command topic.
    pub fn set(&self) -> String {
        format!("{}/set", self.base)
    }

    /// Per-metric JSON state topic.
    pub fn metric_state(&self, metric: &str) -> String {
        format!("{}/{metric}/state", self.base)
    }
}

/// A parsed inbound command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoutedCommand {
    /// `tilt/set` with a validated-later angle.
    Tilt(i64),
    /// `set` with "OPEN".
    Open,
    /// `set` with "CLOSE".
    Close,
}

/// Split an inbound topic into its device address and command suffix.
fn parse_topic(topic: &str) -> Option<(MacAddress, &str)> {
    let rest = topic.strip_prefix(TOPIC_PREFIX)?.strip_prefix("/cover/")?;
    let (segment, suffix) = rest.split_once('/')?;
    let mac = segment.replace('_', ":").parse().ok()?;
    Some((mac, suffix))
}

/// Parse an inbound command payload.
fn parse_command(suffix: &str, payload: &[u8]) -> Result<RoutedCommand, String> {
    match suffix {
        "tilt/set" => serde_json::from_slice::<i64>(payload)
            .map(RoutedCommand::Tilt)
            .map_err(|_| {
                format!(
                    "expected a JSON integer, got '{}'",
                    String::from_utf8_lossy(payload)
                )
            }),
        "set" => match std::str::from_utf8(payload) {
            Ok("OPEN") => Ok(RoutedCommand::Open),
            Ok("CLOSE") => Ok(RoutedCommand::Close),
            Ok(other) => Err(format!("unrecognized command '{other}'")),
            Err(_) => Err("command payload is not UTF-8".to_string()),
        },
        other => Err(format!("unhandled topic suffix '{other}'")),
    }
}

/// The tilt and open/closed publications for a reported angle.
///
/// Angles inside the closed bands snap to the band edge so controllers show
/// a fully closed tilt.
fn angle_payloads(angle: u8) -> (String, &'static str) {
    (
        snap_angle(angle).to_string(),
        CoverState::from_angle(angle).payload(),
    )
}

/// The JSON state payload for a metric event, with its topic slot.
fn metric_payload(event: &BlindEvent) -> Option<(&'static str, String)> {
    let (slot, payload) = match event {
        BlindEvent::BatteryChanged {
            percentage,
            voltage,
            charge,
            temperature,
        } => (
            "battery",
            json!({
                "percentage": percentage,
                "voltage_mv": voltage,
                "charge": charge,
                "temperature_c": temperature,
            }),
        ),
        BlindEvent::InteriorTemperatureChanged { celsius } => {
            ("interior_temperature", json!({ "celsius": celsius }))
        }
        BlindEvent::IlluminanceChanged { lux } => ("illuminance", json!({ "lux": lux })),
        BlindEvent::SolarPanelChanged { voltage } => ("solar_panel", json!({ "voltage_mv": voltage })),
        BlindEvent::ChargingChanged { solar, usb } => {
            ("charging", json!({ "solar": solar, "usb": usb }))
        }
        BlindEvent::OverTemperatureChanged { active } => {
            ("is_over_temperature", json!({ "active": active }))
        }
        BlindEvent::UnderVoltageLockoutChanged { active } => {
            ("is_under_voltage_lockout", json!({ "active": active }))
        }
        BlindEvent::RssiChanged { rssi } => ("rssi", json!({ "dbm": rssi })),
        _ => return None,
    };
    Some((slot, payload.to_string()))
}

/// The controller joining the blind fleet to the broker.
pub struct Bridge {
    config: Config,
    session: Arc<SessionManager>,
    mqtt: MqttClient,
    blinds: HashMap<MacAddress, Arc<BlindDevice>>,
    cancel: CancellationToken,
    disposed: AtomicBool,
}

impl Bridge {
    /// Build the fleet, publish discovery, subscribe command topics, and
    /// start the session.
    ///
    /// Returns once discovery has found every configured device or the
    /// discovery timeout elapsed; the bridge keeps running in background
    /// tasks either way.
    pub async fn start(
        config: Config,
        session: Arc<SessionManager>,
        mqtt: MqttClient,
        inbound: mpsc::UnboundedReceiver<InboundMessage>,
    ) -> anyhow::Result<Arc<Self>> {
        let mut blinds = HashMap::new();
        for entry in &config.smart_blinds.blinds {
            let (mac, passkey) = entry
                .resolve()
                .map_err(|e| anyhow::anyhow!("blind '{}': {e}", entry.name))?;
            let blind = Arc::new(BlindDevice::new(
                BlindConfig {
                    name: entry.name.clone(),
                    mac,
                    passkey,
                    max_unlock_retries: config.smart_blinds.max_unlock_retries,
                },
                Arc::clone(session.bus()),
                Arc::clone(session.queue()),
            ));
            blinds.insert(mac, blind);
        }

        let bridge = Arc::new(Self {
            config,
            session: Arc::clone(&session),
            mqtt,
            blinds,
            cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        });

        let macs: Vec<MacAddress> = bridge.blinds.keys().copied().collect();
        for (mac, blind) in &bridge.blinds {
            let topics = DeviceTopics::new(*mac);
            bridge
                .mqtt
                .subscribe(&topics.set())
                .await
                .with_context(|| format!("subscribing {}", topics.set()))?;
            bridge
                .mqtt
                .subscribe(&topics.tilt_set())
                .await
                .with_context(|| format!("subscribing {}", topics.tilt_set()))?;

            if bridge.config.homeassistant.discovery_enabled {
                bridge.publish_discovery(blind, &topics).await;
            }
            bridge.spawn_event_task(Arc::clone(blind));
            session.add_device(Arc::clone(blind)).await;
        }

        bridge.spawn_inbound_task(inbound);
        session.start(macs).await?;
        Ok(bridge)
    }

    /// Shut the bridge down. Idempotent.
    ///
    /// "offline" goes out for every device *before* the session manager
    /// clears the command queue, so consumers always observe the transition.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Disposing bridge");
        self.cancel.cancel();

        for mac in self.blinds.keys() {
            let topics = DeviceTopics::new(*mac);
            if let Err(e) = self
                .mqtt
                .publish(&topics.availability(), PAYLOAD_OFFLINE, QoS::AtMostOnce, true)
                .await
            {
                warn!(%mac, "Failed to publish offline: {e}");
            }
        }

        self.session.dispose().await;
        self.mqtt.disconnect().await;
        info!("Bridge disposed");
    }

    async fn publish_discovery(&self, blind: &Arc<BlindDevice>, topics: &DeviceTopics) {
        let messages = discovery_messages(
            &self.config.homeassistant.discovery_prefix,
            blind.name(),
            blind.mac(),
            blind.version().await,
            topics,
        );
        for (topic, payload) in messages {
            if let Err(e) = self.mqtt.publish(&topic, payload, QoS::AtMostOnce, true).await {
                warn!(%topic, "Failed to publish discovery config: {e}");
            }
        }
        debug!(mac = %blind.mac(), "Published discovery configs");
    }

    fn spawn_event_task(self: &Arc<Self>, blind: Arc<BlindDevice>) {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            let topics = DeviceTopics::new(blind.mac());
            let mut events = blind.events().subscribe();
            loop {
                tokio::select! {
                    _ = bridge.cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => bridge.handle_event(&blind, &topics, event).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(mac = %blind.mac(), "Event task lagged {n} events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    async fn handle_event(&self, blind: &Arc<BlindDevice>, topics: &DeviceTopics, event: BlindEvent) {
        match &event {
            BlindEvent::AngleChanged { angle } => {
                let (tilt, state) = angle_payloads(*angle);
                self.publish_state(&topics.tilt_state(), tilt, false).await;
                self.publish_state(&topics.state(), state.to_string(), false)
                    .await;
            }
            BlindEvent::Unlocked => {
                self.publish_state(&topics.availability(), PAYLOAD_ONLINE.to_string(), true)
                    .await;
            }
            BlindEvent::Disconnected => {
                self.publish_state(&topics.availability(), PAYLOAD_OFFLINE.to_string(), true)
                    .await;
            }
            BlindEvent::Connected => {
                // The firmware version becomes readable once connected;
                // refresh the retained discovery configs with it.
                if self.config.homeassistant.discovery_enabled {
                    self.publish_discovery(blind, topics).await;
                }
            }
            BlindEvent::UnlockFailed => {
                warn!(
                    mac = %blind.mac(),
                    "Unlock handshake failed; the device will NACK writes"
                );
            }
            _ => {
                if let Some((slot, payload)) = metric_payload(&event) {
                    self.publish_state(&topics.metric_state(slot), payload, false)
                        .await;
                }
            }
        }
    }

    async fn publish_state(&self, topic: &str, payload: String, retain: bool) {
        if let Err(e) = self.mqtt.publish(topic, payload, QoS::AtMostOnce, retain).await {
            warn!(%topic, "Failed to publish: {e}");
        }
    }

    fn spawn_inbound_task(self: &Arc<Self>, mut inbound: mpsc::UnboundedReceiver<InboundMessage>) {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = bridge.cancel.cancelled() => break,
                    message = inbound.recv() => match message {
                        Some(message) => bridge.handle_inbound(message).await,
                        None => break,
                    }
                }
            }
        });
    }

    async fn handle_inbound(&self, message: InboundMessage) {
        let Some((mac, suffix)) = parse_topic(&message.topic) else {
            debug!(topic = %message.topic, "Ignoring message on unrecognized topic");
            return;
        };
        let Some(blind) = self.blinds.get(&mac) else {
            warn!(%mac, "Command for unconfigured device, ignoring");
            return;
        };

        let result = match parse_command(suffix, &message.payload) {
            Ok(RoutedCommand::Open) => blind.set_angle((MAX_ANGLE / 2) as i64).await,
            Ok(RoutedCommand::Close) => blind.set_angle(0).await,
            Ok(RoutedCommand::Tilt(value)) => blind.set_angle(value).await,
            Err(e) => {
                warn!(topic = %message.topic, "Invalid command: {e}");
                return;
            }
        };
        if let Err(e) = result {
            warn!(%mac, topic = %message.topic, "Command rejected: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_topics() {
        let mac: MacAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let topics = DeviceTopics::new(mac);
        assert_eq!(
            topics.availability(),
            "bt2mqtt/cover/AA_BB_CC_DD_EE_FF/availability"
        );
        assert_eq!(topics.state(), "bt2mqtt/cover/AA_BB_CC_DD_EE_FF/state");
        assert_eq!(topics.tilt_state(), "bt2mqtt/cover/AA_BB_CC_DD_EE_FF/tilt/state");
        assert_eq!(topics.tilt_set(), "bt2mqtt/cover/AA_BB_CC_DD_EE_FF/tilt/set");
        assert_eq!(topics.set(), "bt2mqtt/cover/AA_BB_CC_DD_EE_FF/set");
        assert_eq!(
            topics.metric_state("battery"),
            "bt2mqtt/cover/AA_BB_CC_DD_EE_FF/battery/state"
        );
    }

    #[test]
    fn test_parse_topic() {
        let (mac, suffix) = parse_topic("bt2mqtt/cover/AA_BB_CC_DD_EE_FF/set").unwrap();
        assert_eq!(mac.to_string(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(suffix, "set");

        let (_, suffix) = parse_topic("bt2mqtt/cover/AA_BB_CC_DD_EE_FF/tilt/set").unwrap();
        assert_eq!(suffix, "tilt/set");

        assert!(parse_topic("other/cover/AA_BB_CC_DD_EE_FF/set").is_none());
        assert!(parse_topic("bt2mqtt/cover/not-a-mac/set").is_none());
        assert!(parse_topic("bt2mqtt/cover/AA_BB_CC_DD_EE_FF").is_none());
    }

    #[test]
    fn test_parse_command_open_close() {
        assert_eq!(parse_command("set", b"OPEN").unwrap(), RoutedCommand::Open);
        assert_eq!(parse_command("set", b"CLOSE").unwrap(), RoutedCommand::Close);
    }

    #[test]
    fn test_parse_command_is_case_sensitive() {
        assert!(parse_command("set", b"open").is_err());
        assert!(parse_command("set", b"Close").is_err());
        assert!(parse_command("set", b"STOP").is_err());
    }

    #[test]
    fn test_parse_command_tilt() {
        assert_eq!(
            parse_command("tilt/set", b"100").unwrap(),
            RoutedCommand::Tilt(100)
        );
        assert_eq!(
            parse_command("tilt/set", b"0").unwrap(),
            RoutedCommand::Tilt(0)
        );
        // Range validation happens in the device; parsing accepts any integer.
        assert_eq!(
            parse_command("tilt/set", b"999").unwrap(),
            RoutedCommand::Tilt(999)
        );
        assert!(parse_command("tilt/set", b"12.5").is_err());
        assert!(parse_command("tilt/set", b"\"100\"").is_err());
        assert!(parse_command("tilt/set", b"not json").is_err());
    }

    #[test]
    fn test_angle_payloads_snap_and_project() {
        assert_eq!(angle_payloads(0), ("0".to_string(), "closed"));
        assert_eq!(angle_payloads(5), ("0".to_string(), "closed"));
        assert_eq!(angle_payloads(10), ("0".to_string(), "closed"));
        assert_eq!(angle_payloads(11), ("11".to_string(), "open"));
        assert_eq!(angle_payloads(100), ("100".to_string(), "open"));
        assert_eq!(angle_payloads(189), ("189".to_string(), "open"));
        assert_eq!(angle_payloads(190), ("200".to_string(), "closed"));
        assert_eq!(angle_payloads(200), ("200".to_string(), "closed"));
    }

    #[test]
    fn test_metric_payload_battery() {
        let event = BlindEvent::BatteryChanged {
            percentage: 85,
            voltage: 3780,
            charge: 0,
            temperature: 21.2,
        };
        let (slot, payload) = metric_payload(&event).unwrap();
        assert_eq!(slot, "battery");

        let json: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(json["percentage"], 85);
        assert_eq!(json["voltage_mv"], 3780);
        assert_eq!(json["charge"], 0);
    }

    #[test]
    fn test_metric_payload_charging() {
        let event = BlindEvent::ChargingChanged {
            solar: true,
            usb: false,
        };
        let (slot, payload) = metric_payload(&event).unwrap();
        assert_eq!(slot, "charging");
        let json: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(json["solar"], true);
        assert_eq!(json["usb"], false);
    }

    #[test]
    fn test_metric_payload_skips_lifecycle_events() {
        assert!(metric_payload(&BlindEvent::Connected).is_none());
        assert!(metric_payload(&BlindEvent::Unlocked).is_none());
        assert!(metric_payload(&BlindEvent::AngleChanged { angle: 1 }).is_none());
    }
}
