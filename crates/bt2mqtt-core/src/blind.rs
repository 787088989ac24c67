//! The vendor smart-blind protocol over bound GATT characteristics.
//!
//! A [`BlindDevice`] owns one remote device: it binds the vendor
//! characteristics after connect, decodes Angle/Sensors/Status
//! notifications into typed state, runs the passkey unlock handshake, and
//! exposes typed setters that serialize through the shared command queue.
//!
//! # Unlock handshake
//!
//! ```text
//! Locked ──attempt──▶ Unlocking ──echo ok──▶ Unlocked
//!                        │  ▲
//!                 echo mismatch (1s ticker)
//!                        │
//!                 attempts over cap ──▶ Failed
//!
//! any state ──disconnect──▶ Locked
//! ```
//!
//! An attempt writes `passkey || 0x01` to the Passkey characteristic and
//! then reads it back, which forces the device to echo through a
//! notification; `passkey || 0x00` confirms the unlock.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use bt2mqtt_types::{
    CharacteristicSlot, MacAddress, Passkey, SensorReadings, StatusFlags, validate_angle,
};

use crate::bus::{
    BleBus, Device1Proxy, GattCharacteristic1Proxy, WriteMode, read_options,
    wait_for_services_resolved, write_options,
};
use crate::commands::{CommandQueue, QueuedCommand};
use crate::error::{Error, Result};
use crate::events::{BlindEvent, EventDispatcher, diff_sensors, diff_status};

/// Retries for user-initiated setter commands.
const SETTER_RETRIES: u32 = 2;

/// Interval between unlock attempts.
const UNLOCK_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Static configuration for one blind.
#[derive(Debug, Clone)]
pub struct BlindConfig {
    /// Friendly name from the configuration file.
    pub name: String,
    /// The device address.
    pub mac: MacAddress,
    /// The unlock passkey.
    pub passkey: Passkey,
    /// Unlock attempt cap before giving up.
    pub max_unlock_retries: u32,
}

/// State of the unlock handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnlockState {
    /// No handshake has succeeded on this connection.
    #[default]
    Locked,
    /// Attempts are in flight.
    Unlocking {
        /// Attempts made so far.
        attempts: u32,
    },
    /// The device echoed the accepted-key payload.
    Unlocked,
    /// The attempt cap was reached.
    Failed,
}

#[derive(Default)]
struct BlindState {
    device: Option<Device1Proxy<'static>>,
    device_path: Option<String>,
    characteristics: HashMap<CharacteristicSlot, GattCharacteristic1Proxy<'static>>,
    /// Cancels notification, watch, and unlock tasks for this connection.
    conn_cancel: Option<CancellationToken>,
    unlock_cancel: Option<CancellationToken>,
    unlock: UnlockState,
    angle: Option<u8>,
    sensors: Option<SensorReadings>,
    status: Option<StatusFlags>,
    rssi: Option<i16>,
    reported_name: Option<String>,
    version: Option<String>,
}

/// One configured blind and its BLE session state.
pub struct BlindDevice {
    config: BlindConfig,
    bus: Arc<BleBus>,
    queue: Arc<CommandQueue>,
    events: EventDispatcher,
    state: Mutex<BlindState>,
    disposed: AtomicBool,
}

impl BlindDevice {
    /// Create a blind device. It stays idle until the session manager
    /// connects it.
    pub fn new(config: BlindConfig, bus: Arc<BleBus>, queue: Arc<CommandQueue>) -> Self {
        Self {
            config,
            bus,
            queue,
            events: EventDispatcher::new(100),
            state: Mutex::new(BlindState::default()),
            disposed: AtomicBool::new(false),
        }
    }

    /// The device address.
    pub fn mac(&self) -> MacAddress {
        self.config.mac
    }

    /// The configured friendly name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The event dispatcher for this device.
    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// Whether a connection is currently bound.
    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.device.is_some()
    }

    /// Whether `dispose()` has run.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Current unlock state.
    pub async fn unlock_state(&self) -> UnlockState {
        self.state.lock().await.unlock
    }

    /// Last reported angle, if any notification has arrived.
    pub async fn angle(&self) -> Option<u8> {
        self.state.lock().await.angle
    }

    /// Firmware version string read from the VersionInfo characteristic.
    pub async fn version(&self) -> Option<String> {
        self.state.lock().await.version.clone()
    }

    /// Name reported by the device itself, when readable.
    pub async fn reported_name(&self) -> Option<String> {
        self.state.lock().await.reported_name.clone()
    }

    /// Connect to the device at `path` and bind the vendor characteristics.
    ///
    /// Runs inside a queued command, so it is serialized with every other
    /// GATT operation. Any failure during binding disconnects the device;
    /// no partial bindings are retained.
    pub async fn connect(self: &Arc<Self>, path: &str) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        if self.is_connected().await {
            debug!(mac = %self.config.mac, "Already connected");
            return Ok(());
        }

        info!(mac = %self.config.mac, %path, "Connecting");
        let device = self.bus.device(path).await?;
        device.connect().await.map_err(Error::from_bus)?;

        let conn_cancel = CancellationToken::new();
        if let Err(e) = self.bind(path, &device, &conn_cancel).await {
            warn!(mac = %self.config.mac, "Binding failed, disconnecting: {e}");
            conn_cancel.cancel();
            self.state.lock().await.characteristics.clear();
            if let Err(de) = device.disconnect().await {
                debug!(mac = %self.config.mac, "Disconnect after failed binding: {de}");
            }
            return Err(e);
        }

        {
            let mut state = self.state.lock().await;
            state.device = Some(device.clone());
            state.device_path = Some(path.to_string());
            state.conn_cancel = Some(conn_cancel.clone());
        }
        self.spawn_device_watch(device, conn_cancel.clone());

        info!(mac = %self.config.mac, "Connected");
        self.events.send(BlindEvent::Connected);
        self.begin_unlock(&conn_cancel).await;
        Ok(())
    }

    /// Queue a write of a new blind angle (request-mode, one byte).
    ///
    /// The angle must be in `[0, 200]`; anything else is rejected before the
    /// queue is touched. The device itself NACKs writes while locked, so the
    /// write is queued regardless of unlock state.
    pub async fn set_angle(&self, value: i64) -> Result<()> {
        let angle = validate_angle(value).map_err(|e| Error::invalid_input(e.to_string()))?;
        let characteristic = match self.characteristic(CharacteristicSlot::Angle).await {
            Ok(c) => c,
            Err(e) => {
                warn!(mac = %self.config.mac, "Cannot set angle: {e}");
                return Err(e);
            }
        };

        debug!(mac = %self.config.mac, angle, "Queueing angle write");
        self.queue
            .execute(QueuedCommand::new(
                format!("set-angle {}", self.config.mac),
                SETTER_RETRIES,
                move || {
                    let characteristic = characteristic.clone();
                    async move {
                        characteristic
                            .write_value(&[angle], write_options(0, WriteMode::Request))
                            .await
                            .map_err(Error::from_bus)
                    }
                },
            ))
            .await;
        Ok(())
    }

    /// Tear the device down. Idempotent.
    ///
    /// Stops notifications on each bound characteristic (best-effort, each
    /// failure logged and suppressed), clears the handles, then disconnects
    /// the underlying device.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(mac = %self.config.mac, "Disposing blind device");

        let (characteristics, device, conn_cancel) = {
            let mut state = self.state.lock().await;
            if let Some(cancel) = state.unlock_cancel.take() {
                cancel.cancel();
            }
            state.unlock = UnlockState::Locked;
            state.device_path = None;
            (
                std::mem::take(&mut state.characteristics),
                state.device.take(),
                state.conn_cancel.take(),
            )
        };
        if let Some(cancel) = conn_cancel {
            cancel.cancel();
        }

        for (slot, characteristic) in characteristics {
            if let Err(e) = characteristic.stop_notify().await {
                debug!(mac = %self.config.mac, %slot, "Failed to stop notifications: {e}");
            }
        }

        if let Some(device) = device {
            if let Err(e) = device.disconnect().await {
                debug!(mac = %self.config.mac, "Disconnect during dispose: {e}");
            }
            self.events.send(BlindEvent::Disconnected);
        }
    }

    async fn bind(
        self: &Arc<Self>,
        path: &str,
        device: &Device1Proxy<'static>,
        conn_cancel: &CancellationToken,
    ) -> Result<()> {
        wait_for_services_resolved(device).await?;

        let discovered = self.bus.characteristics_under(path).await?;
        let mut characteristics = HashMap::new();
        for found in discovered {
            let Ok(uuid) = Uuid::parse_str(&found.uuid) else {
                continue;
            };
            let Some(slot) = CharacteristicSlot::from_uuid(uuid) else {
                continue;
            };
            let proxy = self.bus.characteristic(found.path.as_str()).await?;
            debug!(mac = %self.config.mac, %slot, path = %found.path.as_str(), "Bound characteristic");
            characteristics.insert(slot, proxy);
        }
        info!(
            mac = %self.config.mac,
            count = characteristics.len(),
            "Characteristic binding complete"
        );

        for slot in CharacteristicSlot::NOTIFIED {
            let Some(characteristic) = characteristics.get(&slot) else {
                warn!(mac = %self.config.mac, %slot, "Characteristic missing, skipping notifications");
                continue;
            };
            characteristic.start_notify().await.map_err(Error::from_bus)?;
            self.spawn_notification_task(slot, characteristic.clone(), conn_cancel.child_token());
        }

        let reported_name = match characteristics.get(&CharacteristicSlot::Name) {
            Some(c) => read_string(c).await,
            None => None,
        };
        let version = match characteristics.get(&CharacteristicSlot::VersionInfo) {
            Some(c) => read_string(c).await,
            None => None,
        };

        {
            let mut state = self.state.lock().await;
            state.characteristics = characteristics;
            state.reported_name = reported_name.clone();
            state.version = version;
            state.unlock = UnlockState::Locked;
        }
        if let Some(name) = reported_name {
            self.events.send(BlindEvent::NameChanged { name });
        }
        Ok(())
    }

    async fn characteristic(
        &self,
        slot: CharacteristicSlot,
    ) -> Result<GattCharacteristic1Proxy<'static>> {
        self.state
            .lock()
            .await
            .characteristics
            .get(&slot)
            .cloned()
            .ok_or(Error::CharacteristicMissing { slot })
    }

    async fn begin_unlock(self: &Arc<Self>, conn_cancel: &CancellationToken) {
        if !self.config.passkey.is_standard_length() {
            warn!(
                mac = %self.config.mac,
                "Passkey is not 12 hex characters; the derived unlock payload is untested"
            );
        }

        let cancel = conn_cancel.child_token();
        {
            let mut state = self.state.lock().await;
            state.unlock = UnlockState::Unlocking { attempts: 0 };
            state.unlock_cancel = Some(cancel.clone());
        }

        let blind = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(UNLOCK_RETRY_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if !blind.attempt_unlock().await {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Make one unlock attempt. Returns false once the handshake is settled.
    async fn attempt_unlock(self: &Arc<Self>) -> bool {
        let attempts = {
            let mut state = self.state.lock().await;
            match &mut state.unlock {
                UnlockState::Unlocking { attempts } => {
                    *attempts += 1;
                    *attempts
                }
                _ => return false,
            }
        };

        if attempts > self.config.max_unlock_retries {
            {
                let mut state = self.state.lock().await;
                state.unlock = UnlockState::Failed;
                state.unlock_cancel = None;
            }
            warn!(
                mac = %self.config.mac,
                attempts = attempts - 1,
                "Unlock failed, giving up"
            );
            self.events.send(BlindEvent::UnlockFailed);
            return false;
        }

        debug!(mac = %self.config.mac, attempt = attempts, "Attempting unlock");
        let payload = self.config.passkey.unlock_payload();
        let blind = Arc::clone(self);
        self.queue
            .execute(QueuedCommand::new(
                format!("unlock {}", self.config.mac),
                0,
                move || {
                    let blind = Arc::clone(&blind);
                    let payload = payload.clone();
                    async move {
                        let passkey = blind.characteristic(CharacteristicSlot::Passkey).await?;
                        passkey
                            .write_value(&payload, write_options(0, WriteMode::Request))
                            .await
                            .map_err(Error::from_bus)?;
                        // Reading the characteristic back forces the device
                        // to echo through a notification.
                        passkey
                            .read_value(read_options(0))
                            .await
                            .map_err(Error::from_bus)?;
                        Ok(())
                    }
                },
            ))
            .await;
        true
    }

    fn spawn_notification_task(
        self: &Arc<Self>,
        slot: CharacteristicSlot,
        characteristic: GattCharacteristic1Proxy<'static>,
        cancel: CancellationToken,
    ) {
        let blind = Arc::clone(self);
        tokio::spawn(async move {
            let mut stream = characteristic.receive_value_changed().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    maybe = stream.next() => {
                        let Some(change) = maybe else { break };
                        let Ok(value) = change.get().await else { continue };
                        blind.handle_notification(slot, &value).await;
                    }
                }
            }
            debug!(mac = %blind.config.mac, %slot, "Notification task stopped");
        });
    }

    fn spawn_device_watch(
        self: &Arc<Self>,
        device: Device1Proxy<'static>,
        cancel: CancellationToken,
    ) {
        let blind = Arc::clone(self);
        tokio::spawn(async move {
            let mut connected = device.receive_connected_changed().await;
            let mut rssi = device.receive_rssi_changed().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    maybe = connected.next() => {
                        let still_connected = match maybe {
                            Some(change) => change.get().await.unwrap_or(false),
                            None => false,
                        };
                        if !still_connected {
                            blind.handle_disconnected().await;
                            break;
                        }
                    }
                    maybe = rssi.next() => {
                        let Some(change) = maybe else { break };
                        if let Ok(value) = change.get().await {
                            blind.update_rssi(value).await;
                        }
                    }
                }
            }
        });
    }

    async fn handle_notification(self: &Arc<Self>, slot: CharacteristicSlot, data: &[u8]) {
        match slot {
            CharacteristicSlot::Angle => self.handle_angle_notification(data).await,
            CharacteristicSlot::Sensors => self.handle_sensors_notification(data).await,
            CharacteristicSlot::Status => self.handle_status_notification(data).await,
            CharacteristicSlot::Passkey => self.handle_passkey_notification(data).await,
            _ => {}
        }
    }

    async fn handle_angle_notification(&self, data: &[u8]) {
        let Some(&angle) = data.first() else {
            warn!(mac = %self.config.mac, "Empty angle notification");
            return;
        };
        let changed = {
            let mut state = self.state.lock().await;
            let changed = state.angle != Some(angle);
            state.angle = Some(angle);
            changed
        };
        if changed {
            self.events.send(BlindEvent::AngleChanged { angle });
        }
    }

    async fn handle_sensors_notification(&self, data: &[u8]) {
        let readings = match SensorReadings::from_bytes(data) {
            Ok(readings) => readings,
            Err(e) => {
                warn!(mac = %self.config.mac, "Bad sensor payload: {e}");
                return;
            }
        };

        // Two-phase update: collect the change events, commit the new state,
        // then emit, so observers never see torn state.
        let events = {
            let mut state = self.state.lock().await;
            let events = match state.sensors {
                Some(old) => diff_sensors(&old, &readings),
                None => vec![
                    BlindEvent::BatteryChanged {
                        percentage: readings.battery_percentage,
                        voltage: readings.battery_voltage,
                        charge: readings.battery_charge,
                        temperature: readings.battery_temperature,
                    },
                    BlindEvent::InteriorTemperatureChanged {
                        celsius: readings.interior_temperature,
                    },
                    BlindEvent::IlluminanceChanged {
                        lux: readings.illuminance,
                    },
                    BlindEvent::SolarPanelChanged {
                        voltage: readings.solar_panel_voltage,
                    },
                ],
            };
            state.sensors = Some(readings);
            events
        };
        for event in events {
            self.events.send(event);
        }
    }

    async fn handle_status_notification(&self, data: &[u8]) {
        let flags = match StatusFlags::from_bytes(data) {
            Ok(flags) => flags,
            Err(e) => {
                warn!(mac = %self.config.mac, "Bad status payload: {e}");
                return;
            }
        };

        let events = {
            let mut state = self.state.lock().await;
            let events = match state.status {
                Some(old) => diff_status(&old, &flags),
                None => vec![
                    BlindEvent::ChargingChanged {
                        solar: flags.is_solar_charging,
                        usb: flags.is_usb_charging,
                    },
                    BlindEvent::OverTemperatureChanged {
                        active: flags.is_over_temperature,
                    },
                    BlindEvent::UnderVoltageLockoutChanged {
                        active: flags.is_under_voltage_lockout,
                    },
                    BlindEvent::StatusChanged { flags },
                ],
            };
            state.status = Some(flags);
            events
        };
        for event in events {
            self.events.send(event);
        }
    }

    async fn handle_passkey_notification(&self, data: &[u8]) {
        let unlocked = {
            let mut state = self.state.lock().await;
            match state.unlock {
                UnlockState::Unlocking { attempts } => {
                    if self.config.passkey.matches_echo(data) {
                        state.unlock = UnlockState::Unlocked;
                        if let Some(cancel) = state.unlock_cancel.take() {
                            cancel.cancel();
                        }
                        true
                    } else {
                        debug!(
                            mac = %self.config.mac,
                            attempts,
                            "Passkey echo mismatch, handshake continues"
                        );
                        false
                    }
                }
                _ => false,
            }
        };
        if unlocked {
            info!(mac = %self.config.mac, "Unlocked");
            self.events.send(BlindEvent::Unlocked);
        }
    }

    async fn update_rssi(&self, rssi: i16) {
        let changed = {
            let mut state = self.state.lock().await;
            let changed = state.rssi != Some(rssi);
            state.rssi = Some(rssi);
            changed
        };
        if changed {
            self.events.send(BlindEvent::RssiChanged { rssi });
        }
    }

    async fn handle_disconnected(&self) {
        let had_connection = {
            let mut state = self.state.lock().await;
            let had = state.device.is_some();
            if let Some(cancel) = state.conn_cancel.take() {
                cancel.cancel();
            }
            state.unlock_cancel = None;
            state.characteristics.clear();
            state.device = None;
            state.device_path = None;
            state.unlock = UnlockState::Locked;
            had
        };
        if had_connection {
            info!(mac = %self.config.mac, "Disconnected");
            self.events.send(BlindEvent::Disconnected);
        }
    }
}

impl std::fmt::Debug for BlindDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlindDevice")
            .field("name", &self.config.name)
            .field("mac", &self.config.mac)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

/// Read a characteristic as a NUL-trimmed UTF-8 string, best-effort.
async fn read_string(characteristic: &GattCharacteristic1Proxy<'static>) -> Option<String> {
    match characteristic.read_value(read_options(0)).await {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes)
                .trim_end_matches('\0')
                .to_string();
            (!text.is_empty()).then_some(text)
        }
        Err(e) => {
            debug!("Characteristic read failed: {e}");
            None
        }
    }
}
