//! Integration tests for bt2mqtt-core.
//!
//! These tests require a running Bluetooth daemon (and, for the connect
//! test, a configured blind in range) and should be run with:
//! `cargo test --package bt2mqtt-core -- --ignored --nocapture`
//!
//! Set `BT2MQTT_TEST_MAC` and `BT2MQTT_TEST_PASSKEY` to point the connect
//! test at a real device.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use bt2mqtt_core::{
    BleBus, BlindConfig, BlindDevice, SessionConfig, SessionManager, UnlockState,
};
use bt2mqtt_types::Passkey;

const BUS_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
#[ignore = "requires a running Bluetooth daemon"]
async fn test_list_adapters() {
    let bus = Arc::new(BleBus::new());
    timeout(BUS_TIMEOUT, bus.connect())
        .await
        .expect("bus connect timed out")
        .expect("bus connect failed");

    let session = SessionManager::new(bus, SessionConfig::default());
    let adapters = session.get_adapters().await.expect("adapter enumeration failed");

    println!("Found {} adapters", adapters.len());
    for name in &adapters {
        println!("  {name}");
    }
    assert!(!adapters.is_empty(), "expected at least one adapter");
}

#[tokio::test]
#[ignore = "requires a blind in range"]
async fn test_discover_and_connect() {
    let Ok(mac) = env::var("BT2MQTT_TEST_MAC") else {
        eprintln!("BT2MQTT_TEST_MAC not set, skipping");
        return;
    };
    let passkey = env::var("BT2MQTT_TEST_PASSKEY").unwrap_or_else(|_| "000000000000".to_string());

    let bus = Arc::new(BleBus::new());
    bus.connect().await.expect("bus connect failed");

    let config = SessionConfig {
        discovery_timeout: Duration::from_secs(30),
        ..SessionConfig::default()
    };
    let session = Arc::new(SessionManager::new(Arc::clone(&bus), config));

    let blind = Arc::new(BlindDevice::new(
        BlindConfig {
            name: "test blind".to_string(),
            mac: mac.parse().expect("invalid BT2MQTT_TEST_MAC"),
            passkey: Passkey::new(&passkey).expect("invalid BT2MQTT_TEST_PASSKEY"),
            max_unlock_retries: 5,
        },
        bus,
        Arc::clone(session.queue()),
    ));
    let target = blind.mac();

    session.add_device(Arc::clone(&blind)).await;
    session.start(vec![target]).await.expect("session start failed");

    // Give the connect command and unlock handshake time to run.
    tokio::time::sleep(Duration::from_secs(20)).await;

    println!("connected: {}", blind.is_connected().await);
    println!("unlock state: {:?}", blind.unlock_state().await);
    println!("angle: {:?}", blind.angle().await);
    println!("version: {:?}", blind.version().await);
    assert!(blind.is_connected().await, "expected an active connection");
    assert_eq!(blind.unlock_state().await, UnlockState::Unlocked);

    session.dispose().await;
}
