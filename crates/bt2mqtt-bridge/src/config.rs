//! Service configuration.
//!
//! Loaded from a YAML file (conventionally mounted read-only), then
//! overridden by `BT2MQTT_<SECTION>_<KEY>` environment variables.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use bt2mqtt_core::SessionConfig;
use bt2mqtt_types::{MacAddress, Passkey};

/// The environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "BT2MQTT_";

/// Service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Adapter selection.
    pub adapter: AdapterConfig,
    /// Discovery timing.
    pub bluetooth: BluetoothConfig,
    /// MQTT broker settings.
    pub mqtt: MqttConfig,
    /// Home Assistant auto-discovery settings.
    pub homeassistant: HomeAssistantConfig,
    /// The blinds to bridge.
    pub smart_blinds: SmartBlindsConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Apply `BT2MQTT_<SECTION>_<KEY>` overrides from an environment
    /// key/value iterator.
    ///
    /// Unknown keys and unparseable values are logged and skipped so a typo
    /// in the environment cannot take the service down.
    pub fn apply_env_overrides<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(rest) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match rest {
                "ADAPTER_NAME" => self.adapter.name = Some(value),
                "BLUETOOTH_DEVICE_DISCOVERY_INTERVAL" => {
                    parse_override(rest, &value, &mut self.bluetooth.device_discovery_interval);
                }
                "BLUETOOTH_DEVICE_DISCOVERY_TIMEOUT" => {
                    parse_override(rest, &value, &mut self.bluetooth.device_discovery_timeout);
                }
                "MQTT_CLIENT_ID" => self.mqtt.client_id = Some(value),
                "MQTT_HOST" => self.mqtt.host = value,
                "MQTT_PORT" => parse_override(rest, &value, &mut self.mqtt.port),
                "MQTT_USERNAME" => self.mqtt.username = Some(value),
                "MQTT_PASSWORD" => self.mqtt.password = Some(value),
                "HOMEASSISTANT_DISCOVERY_ENABLED" => {
                    parse_override(rest, &value, &mut self.homeassistant.discovery_enabled);
                }
                "HOMEASSISTANT_DISCOVERY_PREFIX" => self.homeassistant.discovery_prefix = value,
                "SMART_BLINDS_MAX_CONNECT_RETRIES" => {
                    parse_override(rest, &value, &mut self.smart_blinds.max_connect_retries);
                }
                "SMART_BLINDS_CONNECT_RETRY_INTERVAL" => {
                    parse_override(rest, &value, &mut self.smart_blinds.connect_retry_interval);
                }
                "SMART_BLINDS_MAX_UNLOCK_RETRIES" => {
                    parse_override(rest, &value, &mut self.smart_blinds.max_unlock_retries);
                }
                other => warn!("Ignoring unknown override {ENV_PREFIX}{other}"),
            }
        }
    }

    /// Validate the configuration and collect every problem at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.mqtt.host.is_empty() {
            errors.push(ValidationError {
                field: "mqtt.host".to_string(),
                message: "host cannot be empty".to_string(),
            });
        }
        if self.mqtt.port == 0 {
            errors.push(ValidationError {
                field: "mqtt.port".to_string(),
                message: "port cannot be 0".to_string(),
            });
        }
        if self.bluetooth.device_discovery_timeout == 0 {
            errors.push(ValidationError {
                field: "bluetooth.device_discovery_timeout".to_string(),
                message: "discovery timeout must be at least 1 second".to_string(),
            });
        }
        if self.smart_blinds.blinds.is_empty() {
            errors.push(ValidationError {
                field: "smart_blinds.blinds".to_string(),
                message: "at least one blind must be configured".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for (i, blind) in self.smart_blinds.blinds.iter().enumerate() {
            let prefix = format!("smart_blinds.blinds[{i}]");
            if blind.name.is_empty() {
                errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: "name cannot be empty".to_string(),
                });
            }
            match blind.resolve() {
                Ok((mac, _)) => {
                    if !seen.insert(mac) {
                        errors.push(ValidationError {
                            field: format!("{prefix}.mac"),
                            message: format!("duplicate blind address '{mac}'"),
                        });
                    }
                }
                Err(message) => errors.push(ValidationError {
                    field: prefix,
                    message,
                }),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// The session-manager configuration derived from this file.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            adapter_name: self.adapter.name.clone(),
            discovery_timeout: Duration::from_secs(self.bluetooth.device_discovery_timeout),
            discovery_interval: Duration::from_secs(self.bluetooth.device_discovery_interval),
            max_connect_retries: self.smart_blinds.max_connect_retries,
            connect_retry_interval: Duration::from_secs(self.smart_blinds.connect_retry_interval),
        }
    }
}

/// Adapter selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Adapter name (e.g. "hci0"); the first available adapter when unset.
    pub name: Option<String>,
}

/// Discovery timing, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Delay before restarting discovery for a device that left range.
    pub device_discovery_interval: u64,
    /// How long startup waits for all configured devices to appear.
    pub device_discovery_timeout: u64,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            device_discovery_interval: 30,
            device_discovery_timeout: 60,
        }
    }
}

/// MQTT broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Client identifier; defaults to "bt2mqtt".
    pub client_id: Option<String>,
    /// Broker hostname.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Optional username.
    pub username: Option<String>,
    /// Optional password.
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
        }
    }
}

/// Home Assistant auto-discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HomeAssistantConfig {
    /// Whether discovery payloads are published on startup.
    pub discovery_enabled: bool,
    /// Topic prefix the controller listens on.
    pub discovery_prefix: String,
}

impl Default for HomeAssistantConfig {
    fn default() -> Self {
        Self {
            discovery_enabled: true,
            discovery_prefix: "homeassistant".to_string(),
        }
    }
}

/// Blind fleet settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmartBlindsConfig {
    /// Connect retry cap per device; `-1` disables the cap.
    pub max_connect_retries: i32,
    /// Seconds between connect retries.
    pub connect_retry_interval: u64,
    /// Unlock attempt cap per connection.
    pub max_unlock_retries: u32,
    /// The configured blinds.
    pub blinds: Vec<BlindEntry>,
}

impl Default for SmartBlindsConfig {
    fn default() -> Self {
        Self {
            max_connect_retries: 5,
            connect_retry_interval: 15,
            max_unlock_retries: 5,
            blinds: Vec::new(),
        }
    }
}

/// One configured blind.
///
/// Carries either `mac` + `passkey` in plain form, or the vendor app's
/// base64 `encoded_mac` + `encoded_passkey` export.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BlindEntry {
    /// Friendly name, used for topics and discovery.
    pub name: String,
    /// Plain MAC address.
    pub mac: Option<String>,
    /// Plain hex passkey.
    pub passkey: Option<String>,
    /// Vendor-app export of the address.
    pub encoded_mac: Option<String>,
    /// Vendor-app export of the passkey.
    pub encoded_passkey: Option<String>,
}

impl BlindEntry {
    /// Resolve this entry to a concrete address and passkey.
    pub fn resolve(&self) -> Result<(MacAddress, Passkey), String> {
        let mac = match (&self.mac, &self.encoded_mac) {
            (Some(mac), _) => mac.parse().map_err(|e| format!("mac: {e}"))?,
            (None, Some(encoded)) => {
                MacAddress::from_encoded(encoded).map_err(|e| format!("encoded_mac: {e}"))?
            }
            (None, None) => return Err("either mac or encoded_mac is required".to_string()),
        };
        let passkey = match (&self.passkey, &self.encoded_passkey) {
            (Some(passkey), _) => Passkey::new(passkey).map_err(|e| format!("passkey: {e}"))?,
            (None, Some(encoded)) => {
                Passkey::from_encoded(encoded).map_err(|e| format!("encoded_passkey: {e}"))?
            }
            (None, None) => return Err("either passkey or encoded_passkey is required".to_string()),
        };
        Ok((mac, passkey))
    }
}

/// A single validation problem.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Could not read the file.
    #[error("Failed to read config {path}: {source}")]
    Read {
        /// The path that failed.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The file is not valid YAML for this schema.
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        /// The path that failed.
        path: PathBuf,
        /// The underlying parse error.
        source: serde_yaml::Error,
    },

    /// The file parsed but its contents are unusable.
    #[error("Invalid configuration: {}", format_validation(.0))]
    Validation(Vec<ValidationError>),
}

fn format_validation(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str, target: &mut T) {
    match value.parse() {
        Ok(parsed) => *target = parsed,
        Err(_) => warn!("Ignoring override {ENV_PREFIX}{key}: cannot parse '{value}'"),
    }
}
