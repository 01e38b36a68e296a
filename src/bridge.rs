//! Wires the relay controller, the broker and the router together.

use crate::config::Config;
use crate::error::{BridgeError, Result};
use crate::mqtt::{BrokerEvent, MqttClient, SwitchPublisher, TopicScheme};
use crate::relay::RelayClient;
use crate::router::{self, Router};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How long the initial broker handshake may take before startup fails.
pub const BROKER_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const NOTIFICATION_BUFFER: usize = 64;

pub struct Bridge {
    config: Config,
}

impl Bridge {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the bridge until `cancel` fires.
    ///
    /// Fails only if the broker does not acknowledge the initial connection;
    /// everything after that is logged and recovered from in place.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mqtt = &self.config.mqtt;
        info!(
            "[MQTT] Connecting to {}:{} as {}",
            mqtt.broker_host, mqtt.broker_port, mqtt.client_id
        );

        let mqtt_client = MqttClient::new(mqtt);
        let link = mqtt_client.client();
        let (notify_tx, mut notify_rx) = mpsc::channel::<BrokerEvent>(NOTIFICATION_BUFFER);

        // Start the event loop first so it can establish the connection
        let mqtt_loop = tokio::spawn(mqtt_client.run(notify_tx, cancel.clone()));

        match tokio::time::timeout(BROKER_CONNECT_TIMEOUT, wait_connected(&mut notify_rx)).await {
            Ok(Ok(())) => info!("[MQTT] Connection established"),
            Ok(Err(e)) => {
                cancel.cancel();
                let _ = mqtt_loop.await;
                return Err(e);
            }
            Err(_) => {
                cancel.cancel();
                let _ = mqtt_loop.await;
                return Err(BridgeError::BrokerConnectTimeout(BROKER_CONNECT_TIMEOUT));
            }
        }

        let (events_tx, events_rx) = router::event_channel();
        let publisher = Arc::new(SwitchPublisher::new(
            Arc::new(link),
            TopicScheme::from_config(mqtt),
            events_tx.clone(),
        ));
        let relay = Arc::new(RelayClient::new(self.config.device.clone(), events_tx));

        let tasks = vec![
            mqtt_loop,
            tokio::spawn(publisher.clone().run_inbound(notify_rx, cancel.clone())),
            tokio::spawn(publisher.clone().run_refresh(cancel.clone())),
            tokio::spawn(relay.clone().run(cancel.clone())),
        ];

        info!(
            "[Router] Bridging {} ({}:{}) with group {}",
            self.config.device.name, self.config.device.host, self.config.device.port, mqtt.group_id
        );
        Router::new(events_rx, relay, publisher).run(cancel.clone()).await;

        for task in tasks {
            if let Err(e) = task.await {
                warn!("Bridge task ended abnormally: {}", e);
            }
        }
        Ok(())
    }
}

/// Wait for the first ConnAck, discarding anything that arrives before it.
async fn wait_connected(notifications: &mut mpsc::Receiver<BrokerEvent>) -> Result<()> {
    while let Some(notification) = notifications.recv().await {
        if notification == BrokerEvent::Connected {
            return Ok(());
        }
    }
    Err(BridgeError::BrokerEventLoopClosed)
}
