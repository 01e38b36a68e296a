//! MQTT client wrapper for the broker connection.

use crate::config::MqttConfig;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Requests buffered between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 100;

/// Message received from MQTT broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
}

/// Notification from the MQTT event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// The broker acknowledged a (re)connection.
    Connected,
    Message(MqttMessage),
}

/// MQTT client with a fixed client identifier.
pub struct MqttClient {
    client: AsyncClient,
    event_loop: EventLoop,
}

impl MqttClient {
    /// Create a new MQTT client from configuration.
    pub fn new(config: &MqttConfig) -> Self {
        let mut options =
            MqttOptions::new(&config.client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(KEEP_ALIVE);

        if let Some((username, password)) = config.credentials() {
            options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);

        Self { client, event_loop }
    }

    /// Get a clone of the async client for publishing from other tasks.
    pub fn client(&self) -> AsyncClient {
        self.client.clone()
    }

    /// Run the MQTT event loop and forward notifications to the provided channel.
    ///
    /// Connection errors are logged and the loop keeps polling, which makes
    /// rumqttc reconnect. Stops when `cancel` fires or the channel closes.
    pub async fn run(mut self, tx: mpsc::Sender<BrokerEvent>, cancel: CancellationToken) {
        info!("[MQTT] Starting event loop");

        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = self.event_loop.poll() => polled,
            };

            let notification = match polled {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("[MQTT] Connected to MQTT server");
                    BrokerEvent::Connected
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let payload = match String::from_utf8(publish.payload.to_vec()) {
                        Ok(s) => s,
                        Err(e) => {
                            warn!("[MQTT] Invalid UTF-8 in payload on {}: {}", publish.topic, e);
                            continue;
                        }
                    };
                    BrokerEvent::Message(MqttMessage {
                        topic: publish.topic,
                        payload,
                    })
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!("[MQTT] Lost connection from MQTT server: {:?}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                    continue;
                }
            };

            debug!("[MQTT] Notification: {:?}", notification);
            if tx.send(notification).await.is_err() {
                error!("[MQTT] Notification channel closed");
                break;
            }
        }

        info!("[MQTT] Event loop stopped");
    }
}
