//! Service layer for the bt2mqtt smart-blind bridge.
//!
//! Joins the BLE session layer (bt2mqtt-core) to an MQTT broker:
//!
//! - [`config`]: YAML configuration with environment overrides
//! - [`mqtt`]: broker connection and inbound message plumbing
//! - [`discovery`]: Home Assistant auto-discovery payloads
//! - [`bridge`]: the controller mapping device events to topics and
//!   inbound commands to queued GATT writes
//!
//! The binary (`bt2mqtt`) wires these together behind `list-adapters` and
//! `start` subcommands.

pub mod bridge;
pub mod config;
pub mod discovery;
pub mod mqtt;

pub use bridge::{Bridge, DeviceTopics};
pub use config::{Config, ConfigError};
pub use mqtt::{InboundMessage, MqttClient};
