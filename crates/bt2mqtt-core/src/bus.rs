//! Typed surface over the host Bluetooth daemon.
//!
//! The daemon (`org.bluez`) exposes one object path per adapter, device,
//! GATT service, and characteristic. This module defines zbus `#[proxy]`
//! traits for the interfaces the bridge consumes, plus [`BleBus`], an
//! initialization-guarded handle to the system bus that hands out per-object
//! proxies and object-manager queries.
//!
//! Variant typing (string, u16, bool, dict) stays inside this module: call
//! sites build `zvariant::Value` dictionaries here and nowhere else.

use std::collections::HashMap;

use futures::StreamExt;
use tokio::sync::RwLock;
use tracing::debug;
use zbus::fdo::ObjectManagerProxy;
use zbus::names::OwnedInterfaceName;
use zbus::proxy;
use zbus::zvariant::{OwnedObjectPath, OwnedValue, Value};

use crate::error::{Error, Result};

/// The daemon's well-known bus name.
pub const BLUEZ_SERVICE: &str = "org.bluez";

/// Root object path under which adapters live.
pub const BLUEZ_ROOT: &str = "/org/bluez";

/// The adapter interface name, as it appears in object-manager payloads.
pub const ADAPTER_IFACE: &str = "org.bluez.Adapter1";

/// The device interface name.
pub const DEVICE_IFACE: &str = "org.bluez.Device1";

/// The GATT characteristic interface name.
pub const CHARACTERISTIC_IFACE: &str = "org.bluez.GattCharacteristic1";

/// Proxy for `org.bluez.Adapter1`.
#[proxy(interface = "org.bluez.Adapter1", default_service = "org.bluez")]
pub trait Adapter1 {
    /// Start scanning for nearby devices.
    fn start_discovery(&self) -> zbus::Result<()>;

    /// Stop an ongoing discovery session.
    fn stop_discovery(&self) -> zbus::Result<()>;

    /// Restrict discovery; the bridge always filters to LE transport.
    fn set_discovery_filter(&self, filter: HashMap<&str, Value<'_>>) -> zbus::Result<()>;

    /// The Bluetooth address of this adapter.
    #[zbus(property)]
    fn address(&self) -> zbus::Result<String>;

    /// Address type ("public" or "random").
    #[zbus(property)]
    fn address_type(&self) -> zbus::Result<String>;

    /// User-friendly alias.
    #[zbus(property)]
    fn alias(&self) -> zbus::Result<String>;

    /// System-provided adapter name.
    #[zbus(property)]
    fn name(&self) -> zbus::Result<String>;

    /// Whether discovery is currently running.
    #[zbus(property)]
    fn discovering(&self) -> zbus::Result<bool>;

    /// Whether the adapter is powered on.
    #[zbus(property)]
    fn powered(&self) -> zbus::Result<bool>;

    /// Power the adapter on or off.
    #[zbus(property)]
    fn set_powered(&self, powered: bool) -> zbus::Result<()>;
}

/// Proxy for `org.bluez.Device1`.
#[proxy(interface = "org.bluez.Device1", default_service = "org.bluez")]
pub trait Device1 {
    /// Connect to the device.
    fn connect(&self) -> zbus::Result<()>;

    /// Disconnect from the device.
    fn disconnect(&self) -> zbus::Result<()>;

    /// Initiate pairing.
    fn pair(&self) -> zbus::Result<()>;

    /// Cancel an in-progress pairing attempt.
    fn cancel_pairing(&self) -> zbus::Result<()>;

    /// Bluetooth address (e.g. "AA:BB:CC:DD:EE:FF").
    #[zbus(property)]
    fn address(&self) -> zbus::Result<String>;

    /// Address type ("public" or "random").
    #[zbus(property)]
    fn address_type(&self) -> zbus::Result<String>;

    /// User-modifiable alias.
    #[zbus(property)]
    fn alias(&self) -> zbus::Result<String>;

    /// Remote device name (may be absent for unknown devices).
    #[zbus(property)]
    fn name(&self) -> zbus::Result<String>;

    /// Whether the device is currently connected.
    #[zbus(property)]
    fn connected(&self) -> zbus::Result<bool>;

    /// Whether GATT service discovery has completed for this connection.
    #[zbus(property)]
    fn services_resolved(&self) -> zbus::Result<bool>;

    /// Received signal strength (only valid during discovery/connection).
    #[zbus(property, name = "RSSI")]
    fn rssi(&self) -> zbus::Result<i16>;
}

/// Proxy for `org.bluez.GattCharacteristic1`.
#[proxy(interface = "org.bluez.GattCharacteristic1", default_service = "org.bluez")]
pub trait GattCharacteristic1 {
    /// Read the characteristic value.
    fn read_value(&self, options: HashMap<&str, Value<'_>>) -> zbus::Result<Vec<u8>>;

    /// Write the characteristic value.
    fn write_value(&self, value: &[u8], options: HashMap<&str, Value<'_>>) -> zbus::Result<()>;

    /// Enable value-change notifications.
    fn start_notify(&self) -> zbus::Result<()>;

    /// Disable value-change notifications.
    fn stop_notify(&self) -> zbus::Result<()>;

    /// The characteristic UUID.
    #[zbus(property, name = "UUID")]
    fn uuid(&self) -> zbus::Result<String>;

    /// Capability flags ("read", "write", "notify", ...).
    #[zbus(property)]
    fn flags(&self) -> zbus::Result<Vec<String>>;

    /// The last known value; updated by notifications once notifying.
    #[zbus(property)]
    fn value(&self) -> zbus::Result<Vec<u8>>;

    /// Whether notifications are currently enabled.
    #[zbus(property)]
    fn notifying(&self) -> zbus::Result<bool>;
}

/// GATT write mode, mapped to the daemon's `type` write option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Write without response.
    Command,
    /// Write with response.
    Request,
    /// Reliable write (the daemon default when unspecified).
    Reliable,
}

impl WriteMode {
    /// The wire name of this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMode::Command => "command",
            WriteMode::Request => "request",
            WriteMode::Reliable => "reliable",
        }
    }
}

/// Build the options dictionary for a characteristic write.
pub fn write_options(offset: u16, mode: WriteMode) -> HashMap<&'static str, Value<'static>> {
    let mut options = HashMap::new();
    options.insert("offset", Value::from(offset));
    options.insert("type", Value::from(mode.as_str()));
    options
}

/// Build the options dictionary for a characteristic read.
pub fn read_options(offset: u16) -> HashMap<&'static str, Value<'static>> {
    let mut options = HashMap::new();
    options.insert("offset", Value::from(offset));
    options
}

/// Per-interface properties of one managed object.
pub type InterfaceProperties = HashMap<String, OwnedValue>;

/// A characteristic discovered under a connected device.
#[derive(Debug, Clone)]
pub struct DiscoveredCharacteristic {
    /// The characteristic's object path.
    pub path: OwnedObjectPath,
    /// Its UUID, as reported by the daemon.
    pub uuid: String,
}

/// An initialization-guarded handle to the daemon's bus connection.
///
/// All proxy constructors fail with [`Error::NotInitialized`] before
/// `connect()` and after `disconnect()`. The connection is process-wide:
/// the session manager owns the single instance and shares it by `Arc`.
pub struct BleBus {
    conn: RwLock<Option<zbus::Connection>>,
}

impl BleBus {
    /// Create an unconnected bus handle.
    pub fn new() -> Self {
        Self {
            conn: RwLock::new(None),
        }
    }

    /// Connect to the system bus. Idempotent.
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.conn.write().await;
        if guard.is_some() {
            return Ok(());
        }
        let conn = zbus::Connection::system().await.map_err(Error::from_bus)?;
        debug!("Connected to system bus");
        *guard = Some(conn);
        Ok(())
    }

    /// Drop the bus connection, detaching every signal stream. Idempotent.
    pub async fn disconnect(&self) {
        if self.conn.write().await.take().is_some() {
            debug!("Disconnected from system bus");
        }
    }

    /// Get the live connection, or fail if not initialized.
    async fn connection(&self) -> Result<zbus::Connection> {
        self.conn
            .read()
            .await
            .clone()
            .ok_or(Error::NotInitialized)
    }

    /// Object-manager proxy rooted at the daemon.
    pub async fn object_manager(&self) -> Result<ObjectManagerProxy<'static>> {
        let conn = self.connection().await?;
        ObjectManagerProxy::builder(&conn)
            .destination(BLUEZ_SERVICE)
            .map_err(Error::from_bus)?
            .path("/")
            .map_err(Error::from_bus)?
            .build()
            .await
            .map_err(Error::from_bus)
    }

    /// All objects the daemon currently manages.
    pub async fn managed_objects(&self) -> Result<zbus::fdo::ManagedObjects> {
        let om = self.object_manager().await?;
        om.get_managed_objects()
            .await
            .map_err(|e| Error::from_bus(e.into()))
    }

    /// Immediate child object names under a path (e.g. adapter names under
    /// the daemon root, or service names under a device).
    pub async fn children(&self, path: &str) -> Result<Vec<String>> {
        let objects = self.managed_objects().await?;
        let prefix = format!("{path}/");

        let mut names: Vec<String> = objects
            .keys()
            .filter_map(|p| p.as_str().strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(|rest| rest.to_string())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Object paths under `path` implementing `interface`, with properties.
    pub async fn objects_with_interface(
        &self,
        path: &str,
        interface: &str,
    ) -> Result<Vec<(OwnedObjectPath, InterfaceProperties)>> {
        let objects = self.managed_objects().await?;
        let prefix = format!("{path}/");

        let mut found = Vec::new();
        for (object_path, interfaces) in objects {
            if !object_path.as_str().starts_with(&prefix) {
                continue;
            }
            if let Some(props) = iface_properties(&interfaces, interface) {
                found.push((object_path, props.clone()));
            }
        }
        found.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        Ok(found)
    }

    /// All characteristics below a connected device, with their UUIDs.
    ///
    /// Walks the object tree the daemon materialized after service discovery;
    /// callers match the UUIDs against the vendor slot table.
    pub async fn characteristics_under(&self, device_path: &str) -> Result<Vec<DiscoveredCharacteristic>> {
        let objects = self
            .objects_with_interface(device_path, CHARACTERISTIC_IFACE)
            .await?;

        let mut characteristics = Vec::with_capacity(objects.len());
        for (path, props) in objects {
            let Some(uuid) = property_string(&props, "UUID") else {
                continue;
            };
            characteristics.push(DiscoveredCharacteristic { path, uuid });
        }
        Ok(characteristics)
    }

    /// Proxy for an adapter object.
    pub async fn adapter(&self, path: &str) -> Result<Adapter1Proxy<'static>> {
        let conn = self.connection().await?;
        Adapter1Proxy::builder(&conn)
            .path(path.to_string())
            .map_err(Error::from_bus)?
            .build()
            .await
            .map_err(Error::from_bus)
    }

    /// Proxy for a device object.
    pub async fn device(&self, path: &str) -> Result<Device1Proxy<'static>> {
        let conn = self.connection().await?;
        Device1Proxy::builder(&conn)
            .path(path.to_string())
            .map_err(Error::from_bus)?
            .build()
            .await
            .map_err(Error::from_bus)
    }

    /// Proxy for a characteristic object.
    pub async fn characteristic(&self, path: &str) -> Result<GattCharacteristic1Proxy<'static>> {
        let conn = self.connection().await?;
        GattCharacteristic1Proxy::builder(&conn)
            .path(path.to_string())
            .map_err(Error::from_bus)?
            .build()
            .await
            .map_err(Error::from_bus)
    }
}

impl Default for BleBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Await the daemon's `ServicesResolved` transition after a connect.
///
/// Returns immediately when services are already resolved; otherwise waits
/// on the property-change stream. A closed stream means the connection went
/// away before discovery completed.
pub async fn wait_for_services_resolved(device: &Device1Proxy<'_>) -> Result<()> {
    if device.services_resolved().await.map_err(Error::from_bus)? {
        return Ok(());
    }

    let mut stream = device.receive_services_resolved_changed().await;
    while let Some(change) = stream.next().await {
        if change.get().await.map_err(Error::from_bus)? {
            return Ok(());
        }
    }
    Err(Error::NotConnected)
}

/// Look up one interface's property map in an object-manager entry.
pub fn iface_properties<'a>(
    interfaces: &'a HashMap<OwnedInterfaceName, InterfaceProperties>,
    name: &str,
) -> Option<&'a InterfaceProperties> {
    interfaces
        .iter()
        .find_map(|(k, v)| (k.as_str() == name).then_some(v))
}

/// Extract a string property from an object-manager property map.
pub fn property_string(props: &InterfaceProperties, name: &str) -> Option<String> {
    props
        .get(name)
        .and_then(|v| String::try_from(v.clone()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bus_is_initialization_guarded() {
        let bus = BleBus::new();
        assert!(matches!(
            bus.adapter("/org/bluez/hci0").await,
            Err(Error::NotInitialized)
        ));
        assert!(matches!(
            bus.managed_objects().await,
            Err(Error::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let bus = BleBus::new();
        bus.disconnect().await;
        bus.disconnect().await;
        assert!(matches!(
            bus.device("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF").await,
            Err(Error::NotInitialized)
        ));
    }

    #[test]
    fn test_write_options_shape() {
        let options = write_options(0, WriteMode::Request);
        assert_eq!(options.get("type"), Some(&Value::from("request")));
        assert_eq!(options.get("offset"), Some(&Value::from(0u16)));
    }

    #[test]
    fn test_write_mode_names() {
        assert_eq!(WriteMode::Command.as_str(), "command");
        assert_eq!(WriteMode::Request.as_str(), "request");
        assert_eq!(WriteMode::Reliable.as_str(), "reliable");
    }

    #[test]
    fn test_property_string_extraction() {
        let mut props = InterfaceProperties::new();
        props.insert(
            "UUID".to_string(),
            OwnedValue::try_from(Value::from("00001403")).unwrap(),
        );
        assert_eq!(property_string(&props, "UUID"), Some("00001403".to_string()));
        assert_eq!(property_string(&props, "Address"), None);
    }
}
