//! MQTT client plumbing.
//!
//! Wraps a rumqttc [`AsyncClient`]: a background task polls the event loop,
//! forwards inbound publishes on subscribed topics to the bridge through a
//! channel, and rides out broker reconnects. Connection errors are logged
//! but never stop the task.

use std::time::Duration;

use rumqttc::{AsyncClient, ClientError, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MqttConfig;

/// Default client identifier when none is configured.
const DEFAULT_CLIENT_ID: &str = "bt2mqtt";

/// Event-loop channel capacity.
const EVENT_CAPACITY: usize = 100;

/// Delay before re-polling after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// An inbound message from a subscribed topic.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// The topic it arrived on.
    pub topic: String,
    /// The raw payload.
    pub payload: Vec<u8>,
}

/// Handle to the broker connection.
#[derive(Clone)]
pub struct MqttClient {
    client: AsyncClient,
}

impl MqttClient {
    /// Connect to the broker and spawn the event-loop task.
    ///
    /// Returns the client plus the channel on which inbound publishes
    /// arrive. The task runs until `cancel` fires.
    pub fn connect(
        config: &MqttConfig,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<InboundMessage>) {
        let client_id = config.client_id.as_deref().unwrap_or(DEFAULT_CLIENT_ID);
        let mut options = MqttOptions::new(client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, EVENT_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        info!(
            host = %config.host,
            port = config.port,
            %client_id,
            "Connecting to MQTT broker"
        );

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                            info!("MQTT connected: {ack:?}");
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let message = InboundMessage {
                                topic: publish.topic.clone(),
                                payload: publish.payload.to_vec(),
                            };
                            if inbound_tx.send(message).is_err() {
                                debug!("Inbound channel closed, stopping MQTT task");
                                break;
                            }
                        }
                        Ok(Event::Incoming(Packet::PingResp)) => {
                            debug!("MQTT ping response received");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("MQTT connection error: {e}. Reconnecting...");
                            tokio::time::sleep(RECONNECT_DELAY).await;
                        }
                    }
                }
            }
            debug!("MQTT event loop stopped");
        });

        (Self { client }, inbound_rx)
    }

    /// Publish a payload.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ClientError> {
        self.client.publish(topic, qos, retain, payload.into()).await
    }

    /// Subscribe to a topic.
    pub async fn subscribe(&self, topic: &str) -> Result<(), ClientError> {
        self.client.subscribe(topic, QoS::AtLeastOnce).await
    }

    /// Disconnect from the broker.
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("Error disconnecting MQTT client: {e}");
        }
    }
}
