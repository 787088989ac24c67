//! Adapter lifecycle, device discovery, and per-device session management.
//!
//! The [`SessionManager`] owns the one adapter the process uses: it powers it
//! on, runs LE-filtered discovery, watches the daemon's object tree for
//! desired devices appearing and disappearing, and funnels every GATT
//! operation through the shared [`CommandQueue`].
//!
//! Reconnection is deliberately dumb: a per-device counter that is *never*
//! reset on a successful connect. Resetting it tended to produce infinite
//! retry loops when a device threw spurious errors right after connecting;
//! the counter only clears when the device is explicitly removed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use futures::future::BoxFuture;
use tokio::sync::{RwLock, broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bt2mqtt_types::MacAddress;

use crate::blind::BlindDevice;
use crate::bus::{ADAPTER_IFACE, BLUEZ_ROOT, BleBus, DEVICE_IFACE, iface_properties, property_string};
use crate::commands::{CommandQueue, QueuedCommand};
use crate::error::{Error, Result};
use crate::events::BlindEvent;

/// Session manager configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Adapter to use; the first available adapter when unset.
    pub adapter_name: Option<String>,
    /// How long `start()` waits for every desired device to appear.
    pub discovery_timeout: Duration,
    /// Delay before restarting discovery for a device that left range.
    pub discovery_interval: Duration,
    /// Connect retry cap per device; `-1` disables the cap.
    pub max_connect_retries: i32,
    /// Delay between connect retries.
    pub connect_retry_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            adapter_name: None,
            discovery_timeout: Duration::from_secs(60),
            discovery_interval: Duration::from_secs(30),
            max_connect_retries: 5,
            connect_retry_interval: Duration::from_secs(15),
        }
    }
}

/// Whether another reconnect attempt is allowed under the configured cap.
fn retry_allowed(cap: i32, attempts: u32) -> bool {
    cap < 0 || attempts <= cap as u32
}

#[derive(Default)]
struct SessionState {
    adapter_path: Option<String>,
    desired: HashSet<MacAddress>,
    /// Devices the adapter currently knows, keyed by address.
    available: HashMap<MacAddress, String>,
    blinds: HashMap<MacAddress, Arc<BlindDevice>>,
    retries: HashMap<MacAddress, u32>,
}

/// Manager for the adapter and all registered blind devices.
pub struct SessionManager {
    bus: Arc<BleBus>,
    config: SessionConfig,
    queue: Arc<CommandQueue>,
    state: RwLock<SessionState>,
    /// Bumped whenever the available set changes, so `start()` can wait.
    availability_tx: watch::Sender<u64>,
    disposed: AtomicBool,
    cancel: CancellationToken,
}

impl SessionManager {
    /// Create a session manager over an already-connected bus.
    pub fn new(bus: Arc<BleBus>, config: SessionConfig) -> Self {
        let (availability_tx, _) = watch::channel(0);
        Self {
            bus,
            config,
            queue: Arc::new(CommandQueue::new()),
            state: RwLock::new(SessionState::default()),
            availability_tx,
            disposed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// The shared bus handle.
    pub fn bus(&self) -> &Arc<BleBus> {
        &self.bus
    }

    /// The shared command queue.
    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    /// Names of the adapters the daemon exposes.
    pub async fn get_adapters(&self) -> Result<Vec<String>> {
        let objects = self.bus.managed_objects().await?;
        let prefix = format!("{BLUEZ_ROOT}/");

        let mut names: Vec<String> = objects
            .iter()
            .filter(|(_, interfaces)| iface_properties(interfaces, ADAPTER_IFACE).is_some())
            .filter_map(|(path, _)| path.as_str().strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(|rest| rest.to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Bring the adapter up and discover the desired devices.
    ///
    /// Selects the configured adapter (or the first available), powers it on,
    /// attaches object watchers, synthesizes device-added for devices the
    /// daemon already knows, and starts LE discovery. Returns once every
    /// address in `desired` is present, or after the discovery timeout
    /// (discovery keeps running; stragglers arrive through object signals).
    pub async fn start(self: &Arc<Self>, desired: Vec<MacAddress>) -> Result<()> {
        let adapters = self.get_adapters().await?;
        let adapter_name = match &self.config.adapter_name {
            Some(name) => {
                if !adapters.contains(name) {
                    return Err(Error::invalid_input(format!(
                        "adapter '{name}' not found (available: {adapters:?})"
                    )));
                }
                name.clone()
            }
            None => adapters
                .first()
                .cloned()
                .ok_or_else(|| Error::invalid_input("no Bluetooth adapter available"))?,
        };
        let adapter_path = format!("{BLUEZ_ROOT}/{adapter_name}");
        info!(adapter = %adapter_name, "Using adapter {adapter_path}");

        {
            let mut state = self.state.write().await;
            state.adapter_path = Some(adapter_path.clone());
            state.desired = desired.iter().copied().collect();
        }

        self.queue.start().await;

        let adapter = self.bus.adapter(&adapter_path).await?;
        if !adapter.powered().await.map_err(Error::from_bus)? {
            info!("Powering adapter on");
            adapter.set_powered(true).await.map_err(Error::from_bus)?;
        }
        match adapter.address().await {
            Ok(address) => info!(%address, "Adapter initialized"),
            Err(e) => debug!("Adapter address unavailable: {e}"),
        }

        self.spawn_object_watcher(adapter_path.clone()).await?;

        // The daemon may already know some devices; synthesize device-added
        // for them so callers observe uniform semantics.
        let devices = self
            .bus
            .objects_with_interface(&adapter_path, DEVICE_IFACE)
            .await?;
        for (path, props) in devices {
            if let Some(mac) = device_mac(path.as_str(), Some(&props)) {
                self.handle_device_added(mac, path.as_str().to_string()).await;
            }
        }

        self.ensure_discovery().await?;
        self.wait_for_desired().await;
        Ok(())
    }

    /// Start (or re-start) LE-filtered discovery if it is not running.
    pub async fn ensure_discovery(&self) -> Result<()> {
        let Some(adapter_path) = self.state.read().await.adapter_path.clone() else {
            return Err(Error::invalid_input("session not started"));
        };
        let adapter = self.bus.adapter(&adapter_path).await?;

        if adapter.discovering().await.unwrap_or(false) {
            debug!("Discovery already active");
            return Ok(());
        }

        let mut filter = HashMap::new();
        filter.insert("Transport", zbus::zvariant::Value::from("le"));
        adapter
            .set_discovery_filter(filter)
            .await
            .map_err(Error::from_bus)?;

        match adapter.start_discovery().await {
            Ok(()) => {
                info!("Discovery started");
                Ok(())
            }
            Err(e) if e.to_string().contains("InProgress") => {
                debug!("Discovery already in progress");
                Ok(())
            }
            Err(e) => Err(Error::from_bus(e)),
        }
    }

    /// Stop discovery. Idempotent; quiet when discovery was never started.
    pub async fn stop_discovery(&self) -> Result<()> {
        let Some(adapter_path) = self.state.read().await.adapter_path.clone() else {
            return Ok(());
        };
        let adapter = self.bus.adapter(&adapter_path).await?;
        if !adapter.discovering().await.unwrap_or(false) {
            return Ok(());
        }
        match adapter.stop_discovery().await {
            Ok(()) => {
                info!("Discovery stopped");
                Ok(())
            }
            Err(e) if e.to_string().contains("No discovery started") => Ok(()),
            Err(e) => Err(Error::from_bus(e)),
        }
    }

    /// Register a blind device by address.
    ///
    /// Duplicates are ignored with a warning. If the device is already in
    /// the adapter's available set, a connect is queued immediately.
    pub async fn add_device(self: &Arc<Self>, blind: Arc<BlindDevice>) {
        let mac = blind.mac();
        {
            let mut state = self.state.write().await;
            if state.blinds.contains_key(&mac) {
                warn!(%mac, "Device already registered, ignoring");
                return;
            }
            state.blinds.insert(mac, Arc::clone(&blind));
        }
        info!(%mac, "Registered device");

        self.spawn_disconnect_listener(&blind);

        let path = self.state.read().await.available.get(&mac).cloned();
        if let Some(path) = path {
            self.handle_device_added(mac, path).await;
        }
    }

    /// Unregister a blind device and dispose it.
    ///
    /// This is the only place the reconnect counter is cleared.
    pub async fn remove_device(&self, mac: MacAddress) {
        let blind = {
            let mut state = self.state.write().await;
            state.retries.remove(&mac);
            state.blinds.remove(&mac)
        };
        match blind {
            Some(blind) => {
                blind.dispose().await;
                info!(%mac, "Removed device");
            }
            None => warn!(%mac, "Device not registered, nothing to remove"),
        }
    }

    /// Enqueue a command on the shared queue.
    pub async fn execute_command(&self, command: QueuedCommand) {
        self.queue.execute(command).await;
    }

    /// Schedule a reconnect attempt for a registered device.
    ///
    /// Increments the per-device retry counter and, if still under the cap
    /// (or the cap is `-1`), schedules either a direct device-added re-entry
    /// (when the address is still in the available set) or a fresh discovery
    /// round.
    pub fn reconnect_device(self: &Arc<Self>, mac: MacAddress) -> BoxFuture<'static, ()> {
        let this = Arc::clone(self);
        Box::pin(async move { this.reconnect_device_inner(mac).await })
    }

    async fn reconnect_device_inner(self: Arc<Self>, mac: MacAddress) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let attempts = {
            let mut state = self.state.write().await;
            if !state.blinds.contains_key(&mac) {
                return;
            }
            let counter = state.retries.entry(mac).or_insert(0);
            *counter += 1;
            *counter
        };

        if !retry_allowed(self.config.max_connect_retries, attempts) {
            warn!(%mac, attempts, "Connect retry cap reached, giving up");
            return;
        }

        let session = Arc::downgrade(&self);
        let cancel = self.cancel.clone();
        let retry_delay = self.config.connect_retry_interval;
        let discovery_delay = self.config.discovery_interval;
        info!(%mac, attempts, "Scheduling reconnect in {retry_delay:?}");

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(retry_delay) => {}
            }
            let Some(session) = session.upgrade() else {
                return;
            };
            if session.disposed.load(Ordering::SeqCst) {
                return;
            }
            let path = session.state.read().await.available.get(&mac).cloned();
            match path {
                Some(path) => session.handle_device_added(mac, path).await,
                None => {
                    debug!(%mac, "Device not in range, restarting discovery in {discovery_delay:?}");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(discovery_delay) => {}
                    }
                    if let Err(e) = session.ensure_discovery().await {
                        warn!(%mac, "Failed to restart discovery: {e}");
                    }
                }
            }
        });
    }

    /// Tear everything down. Idempotent.
    ///
    /// Children go before parents: discovery, devices, the command queue,
    /// then the bus. Each step is individually guarded so one failure cannot
    /// prevent the rest.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Disposing session manager");
        self.cancel.cancel();

        if let Err(e) = self.stop_discovery().await {
            warn!("Failed to stop discovery: {e}");
        }

        let blinds: Vec<Arc<BlindDevice>> = {
            let mut state = self.state.write().await;
            state.retries.clear();
            state.blinds.drain().map(|(_, blind)| blind).collect()
        };
        for blind in blinds {
            blind.dispose().await;
        }

        self.queue.dispose().await;
        self.bus.disconnect().await;
        info!("Session manager disposed");
    }

    /// Whether `dispose()` has run.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    async fn handle_device_added(self: &Arc<Self>, mac: MacAddress, path: String) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let blind = {
            let mut state = self.state.write().await;
            state.available.insert(mac, path.clone());
            state.blinds.get(&mac).cloned()
        };
        self.availability_tx.send_modify(|generation| *generation += 1);

        let Some(blind) = blind else {
            debug!(%mac, "Device available but not configured, ignoring");
            return;
        };
        if blind.is_connected().await {
            debug!(%mac, "Device already connected");
            return;
        }

        info!(%mac, "Desired device available, queueing connect");
        let session = Arc::downgrade(self);
        let connect = QueuedCommand::new(format!("connect {mac}"), 0, move || {
            let blind = Arc::clone(&blind);
            let path = path.clone();
            let session = session.clone();
            async move {
                match blind.connect(&path).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        if let Some(session) = session.upgrade() {
                            session.reconnect_device(mac).await;
                        }
                        Err(e)
                    }
                }
            }
        });
        self.queue.execute(connect).await;
    }

    async fn handle_device_removed(&self, mac: MacAddress) {
        let was_present = self.state.write().await.available.remove(&mac).is_some();
        if was_present {
            debug!(%mac, "Device left the adapter");
        }
    }

    async fn spawn_object_watcher(self: &Arc<Self>, adapter_path: String) -> Result<()> {
        let om = self.bus.object_manager().await?;
        let session = Arc::clone(self);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut added = match om.receive_interfaces_added().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Failed to subscribe to object-added signals: {e}");
                    return;
                }
            };
            let mut removed = match om.receive_interfaces_removed().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Failed to subscribe to object-removed signals: {e}");
                    return;
                }
            };
            let prefix = format!("{adapter_path}/");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    maybe = added.next() => {
                        let Some(signal) = maybe else { break };
                        let Ok(args) = signal.args() else { continue };
                        let path = args.object_path().as_str().to_string();
                        if !path.starts_with(&prefix) {
                            continue;
                        }
                        let is_device = args
                            .interfaces_and_properties()
                            .keys()
                            .any(|name| name.as_str() == DEVICE_IFACE);
                        if !is_device {
                            continue;
                        }
                        if let Some(mac) = device_mac(&path, None) {
                            session.handle_device_added(mac, path).await;
                        }
                    }
                    maybe = removed.next() => {
                        let Some(signal) = maybe else { break };
                        let Ok(args) = signal.args() else { continue };
                        let path = args.object_path().as_str().to_string();
                        if !path.starts_with(&prefix) {
                            continue;
                        }
                        if !args.interfaces().iter().any(|i| i.as_str() == DEVICE_IFACE) {
                            continue;
                        }
                        if let Some(mac) = device_mac(&path, None) {
                            session.handle_device_removed(mac).await;
                        }
                    }
                }
            }
            debug!("Object watcher stopped");
        });
        Ok(())
    }

    fn spawn_disconnect_listener(self: &Arc<Self>, blind: &Arc<BlindDevice>) {
        let session = Arc::downgrade(self);
        let blind_weak = Arc::downgrade(blind);
        let cancel = self.cancel.clone();
        let mut events = blind.events().subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(BlindEvent::Disconnected) => {
                            let Some(session) = session.upgrade() else { break };
                            let Some(blind) = blind_weak.upgrade() else { break };
                            if blind.is_disposed() {
                                break;
                            }
                            session.reconnect_device(blind.mac()).await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Disconnect listener lagged {n} events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    async fn wait_for_desired(&self) {
        let deadline = Instant::now() + self.config.discovery_timeout;
        let mut rx = self.availability_tx.subscribe();

        loop {
            {
                let state = self.state.read().await;
                let missing: Vec<&MacAddress> = state
                    .desired
                    .iter()
                    .filter(|mac| !state.available.contains_key(mac))
                    .collect();
                if missing.is_empty() {
                    info!("All desired devices discovered");
                    return;
                }
                debug!(?missing, "Waiting for devices");
            }

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                warn!(
                    "Discovery timed out after {:?}; missing devices will be \
                     picked up when they appear",
                    self.config.discovery_timeout
                );
                return;
            };
            match tokio::time::timeout(remaining, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return,
                Err(_) => {
                    warn!(
                        "Discovery timed out after {:?}; missing devices will be \
                         picked up when they appear",
                        self.config.discovery_timeout
                    );
                    return;
                }
            }
        }
    }
}

/// Extract a device address from its object path (and, when present, its
/// `Address` property, which wins over the path segment).
fn device_mac(path: &str, props: Option<&crate::bus::InterfaceProperties>) -> Option<MacAddress> {
    if let Some(props) = props
        && let Some(address) = property_string(props, "Address")
        && let Ok(mac) = address.parse()
    {
        return Some(mac);
    }
    let segment = path.rsplit('/').next()?;
    MacAddress::from_device_id(segment).ok()
}
