//! bt2mqtt - bridge vendor smart blinds from the host Bluetooth daemon
//! to an MQTT broker.
//!
//! Run with: `bt2mqtt start --config /etc/bt2mqtt/config.yaml`

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use bt2mqtt_bridge::bridge::Bridge;
use bt2mqtt_bridge::config::Config;
use bt2mqtt_bridge::mqtt::MqttClient;
use bt2mqtt_core::{BleBus, SessionConfig, SessionManager};

/// BLE smart-blind to MQTT bridge.
#[derive(Parser, Debug)]
#[command(name = "bt2mqtt")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the available Bluetooth adapters.
    ListAdapters,

    /// Run the bridge service in the foreground.
    Start {
        /// Path to the YAML configuration file.
        #[arg(short, long)]
        config: PathBuf,

        /// Also enable debug logging for the bus and MQTT libraries.
        #[arg(long)]
        debug: bool,

        /// Enable debug logging for the bridge.
        #[arg(long)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    match args.command {
        Command::ListAdapters => list_adapters().await,
        Command::Start {
            config,
            debug,
            verbose,
        } => start(config, debug, verbose).await,
    }
}

async fn list_adapters() -> anyhow::Result<()> {
    init_logging(false, false)?;

    let bus = Arc::new(BleBus::new());
    bus.connect().await?;
    let session = SessionManager::new(bus, SessionConfig::default());

    let adapters = session.get_adapters().await?;
    if adapters.is_empty() {
        println!("No Bluetooth adapters found");
    }
    for name in adapters {
        println!("{name}");
    }
    Ok(())
}

async fn start(config_path: PathBuf, debug: bool, verbose: bool) -> anyhow::Result<()> {
    init_logging(debug, verbose)?;

    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides(std::env::vars());
    config.validate()?;
    info!(
        blinds = config.smart_blinds.blinds.len(),
        "Configuration loaded from {}",
        config_path.display()
    );

    let bus = Arc::new(BleBus::new());
    bus.connect().await?;
    let session = Arc::new(SessionManager::new(
        Arc::clone(&bus),
        config.session_config(),
    ));

    let mqtt_cancel = CancellationToken::new();
    let (mqtt, inbound) = MqttClient::connect(&config.mqtt, mqtt_cancel.clone());

    let bridge = Bridge::start(config, session, mqtt, inbound).await?;
    info!("Bridge running");

    wait_for_shutdown(&bridge).await;
    mqtt_cancel.cancel();
    Ok(())
}

/// Wait for a termination signal, then run one idempotent shutdown.
///
/// A second SIGINT while the shutdown is in progress forces an immediate
/// exit.
async fn wait_for_shutdown(bridge: &Arc<Bridge>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
    let mut sigquit = signal(SignalKind::quit()).expect("Failed to install SIGQUIT handler");

    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
        _ = sigquit.recv() => info!("SIGQUIT received"),
    }

    let shutdown = bridge.dispose();
    tokio::pin!(shutdown);
    tokio::select! {
        _ = &mut shutdown => info!("Graceful shutdown complete"),
        _ = sigint.recv() => {
            warn!("Second interrupt, exiting immediately");
            std::process::exit(130);
        }
    }
}

fn init_logging(debug: bool, verbose: bool) -> anyhow::Result<()> {
    let level = if debug || verbose { "debug" } else { "info" };
    let mut filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(format!("bt2mqtt_bridge={level}").parse()?)
        .add_directive(format!("bt2mqtt_core={level}").parse()?);
    if debug {
        filter = filter
            .add_directive("zbus=debug".parse()?)
            .add_directive("rumqttc=debug".parse()?);
    }

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}
