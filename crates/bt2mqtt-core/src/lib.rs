//! BLE session layer for the bt2mqtt smart-blind bridge.
//!
//! This crate talks to the host Bluetooth daemon over the system bus and
//! turns a fleet of vendor smart blinds into typed, event-emitting devices:
//!
//! - **Bus surface** ([`bus`]): zbus proxies for the daemon's adapter,
//!   device, and GATT characteristic interfaces, plus object-manager
//!   enumeration and signal streams.
//! - **Session management** ([`session`]): adapter lifecycle, LE discovery,
//!   desired-device tracking, and the reconnect policy.
//! - **Command queue** ([`commands`]): one serialized pipeline for every
//!   GATT operation on the shared adapter.
//! - **Device protocol** ([`blind`]): characteristic binding, notification
//!   decoding, the passkey unlock handshake, and typed setters.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use bt2mqtt_core::{BleBus, BlindConfig, BlindDevice, SessionConfig, SessionManager};
//!
//! # async fn example(config: BlindConfig) -> bt2mqtt_core::Result<()> {
//! let bus = Arc::new(BleBus::new());
//! bus.connect().await?;
//!
//! let session = Arc::new(SessionManager::new(Arc::clone(&bus), SessionConfig::default()));
//! let blind = Arc::new(BlindDevice::new(config, bus, Arc::clone(session.queue())));
//!
//! let mac = blind.mac();
//! session.add_device(blind).await;
//! session.start(vec![mac]).await?;
//! # Ok(())
//! # }
//! ```

pub mod blind;
pub mod bus;
pub mod commands;
pub mod error;
pub mod events;
pub mod session;

pub use blind::{BlindConfig, BlindDevice, UnlockState};
pub use bus::{BleBus, WriteMode};
pub use commands::{CommandQueue, QueuedCommand};
pub use error::{Error, Result};
pub use events::{BlindEvent, EventDispatcher, EventReceiver, EventSender};
pub use session::{SessionConfig, SessionManager};
