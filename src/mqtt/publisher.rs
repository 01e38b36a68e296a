//! Broker side of the bridge.
//!
//! Keeps the last known state of every relay, announces relays to Home
//! Assistant through discovery config, publishes their state, and turns
//! messages on their command topics into broker events.

use super::client::BrokerEvent;
use super::state::{SwitchState, SwitchStateCache, Update};
use super::topics::TopicScheme;
use crate::error::Result;
use crate::event::Event;
use crate::router::SwitchSink;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How often discovery config and state of every known relay are republished.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

const PAYLOAD_ON: &str = "ON";
const PAYLOAD_OFF: &str = "OFF";

/// The publish/subscribe operations the publisher needs from an MQTT client.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    async fn publish(&self, topic: &str, qos: QoS, payload: String) -> Result<()>;
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()>;
}

#[async_trait]
impl BrokerLink for AsyncClient {
    async fn publish(&self, topic: &str, qos: QoS, payload: String) -> Result<()> {
        AsyncClient::publish(self, topic, qos, false, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        AsyncClient::subscribe(self, topic, qos).await?;
        Ok(())
    }
}

/// Home Assistant MQTT discovery payload for one relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub name: String,
    pub command_topic: String,
    pub state_topic: String,
}

pub struct SwitchPublisher {
    link: Arc<dyn BrokerLink>,
    topics: TopicScheme,
    cache: SwitchStateCache,
    events: mpsc::Sender<Event>,
}

impl SwitchPublisher {
    pub fn new(link: Arc<dyn BrokerLink>, topics: TopicScheme, events: mpsc::Sender<Event>) -> Self {
        Self {
            link,
            topics,
            cache: SwitchStateCache::new(),
            events,
        }
    }

    pub fn cache(&self) -> &SwitchStateCache {
        &self.cache
    }

    /// Record a relay state observed on the device and mirror it to the broker.
    ///
    /// A relay seen for the first time is announced and its command topic
    /// subscribed before its state is published. A value equal to the cached
    /// one publishes nothing.
    pub async fn apply_change(&self, switch_id: &str, on: bool) {
        match self.cache.update(switch_id, on) {
            Update::Unchanged => {
                debug!("[MQTT] Switch {} already {}", switch_id, on_off(on));
                return;
            }
            Update::New => {
                self.publish_discovery(switch_id).await;
                self.subscribe_commands(switch_id).await;
            }
            Update::Changed => {}
        }

        info!("[MQTT] Change switch {} state to {}", switch_id, on_off(on));
        self.publish_state(switch_id, on).await;
    }

    /// Turn a message from the broker into a broker event.
    ///
    /// Messages outside this group's command topics are ignored.
    pub async fn handle_message(&self, topic: &str, payload: &str) {
        debug!("[MQTT] Received message: {} from topic: {}", payload, topic);

        let Some(switch_id) = self.topics.switch_id_from_command(topic) else {
            warn!("[MQTT] Switch id not found in topic name {}", topic);
            return;
        };

        let event = Event::broker(switch_id, payload == PAYLOAD_ON);
        if self.events.send(event).await.is_err() {
            error!("[MQTT] Event channel closed, dropping command for {}", switch_id);
        }
    }

    /// Republish discovery config and state of every known relay.
    pub async fn refresh(&self) {
        for SwitchState { switch_id, on } in self.cache.snapshot() {
            self.publish_discovery(&switch_id).await;
            self.publish_state(&switch_id, on).await;
        }
    }

    /// Restore command subscriptions after the broker session was re-established.
    pub async fn resubscribe(&self) {
        let switches = self.cache.snapshot();
        info!("[MQTT] Restoring {} switch subscriptions", switches.len());
        for SwitchState { switch_id, .. } in &switches {
            self.subscribe_commands(switch_id).await;
        }
        self.refresh().await;
    }

    pub async fn run_refresh(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.refresh().await;
        }
    }

    /// Consume broker notifications until `cancel` fires or the event loop stops.
    ///
    /// Expects to be started after the initial connection is acknowledged, so
    /// every [`BrokerEvent::Connected`] it sees is a reconnect.
    pub async fn run_inbound(
        self: Arc<Self>,
        mut notifications: mpsc::Receiver<BrokerEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let notification = tokio::select! {
                _ = cancel.cancelled() => break,
                notification = notifications.recv() => match notification {
                    Some(notification) => notification,
                    None => break,
                },
            };
            match notification {
                BrokerEvent::Connected => self.resubscribe().await,
                BrokerEvent::Message(msg) => self.handle_message(&msg.topic, &msg.payload).await,
            }
        }
    }

    fn discovery_payload(&self, switch_id: &str) -> Result<String> {
        let config = DiscoveryConfig {
            name: self.topics.display_name(switch_id),
            command_topic: self.topics.command_topic(switch_id),
            state_topic: self.topics.state_topic(switch_id),
        };
        Ok(serde_json::to_string(&config)?)
    }

    async fn publish_discovery(&self, switch_id: &str) {
        let payload = match self.discovery_payload(switch_id) {
            Ok(payload) => payload,
            Err(e) => {
                error!("[MQTT] Cannot encode discovery config for {}: {}", switch_id, e);
                return;
            }
        };
        self.publish(&self.topics.config_topic(switch_id), QoS::AtMostOnce, payload)
            .await;
    }

    async fn publish_state(&self, switch_id: &str, on: bool) {
        self.publish(
            &self.topics.state_topic(switch_id),
            QoS::AtLeastOnce,
            on_off(on).to_string(),
        )
        .await;
    }

    async fn publish(&self, topic: &str, qos: QoS, payload: String) {
        debug!("[MQTT] Publish message to topic {}, payload {}", topic, payload);
        if let Err(e) = self.link.publish(topic, qos, payload).await {
            error!("[MQTT] Error on publish to {}: {}", topic, e);
        }
    }

    async fn subscribe_commands(&self, switch_id: &str) {
        let topic = self.topics.command_topic(switch_id);
        match self.link.subscribe(&topic, QoS::AtLeastOnce).await {
            Ok(()) => info!("[MQTT] Subscribed to topic {}", topic),
            Err(e) => error!("[MQTT] Error on subscribe to topic {}: {}", topic, e),
        }
    }
}

#[async_trait]
impl SwitchSink for SwitchPublisher {
    async fn apply(&self, switch_id: &str, on: bool) {
        self.apply_change(switch_id, on).await;
    }
}

fn on_off(on: bool) -> &'static str {
    if on { PAYLOAD_ON } else { PAYLOAD_OFF }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mqtt::client::MqttMessage;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Call {
        Publish {
            topic: String,
            qos: QoS,
            payload: String,
        },
        Subscribe {
            topic: String,
            qos: QoS,
        },
    }

    /// Broker link that records every operation.
    #[derive(Default)]
    pub(crate) struct RecordingLink {
        calls: Mutex<Vec<Call>>,
    }

    impl RecordingLink {
        pub(crate) fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        fn take(&self) -> Vec<Call> {
            std::mem::take(&mut *self.calls.lock())
        }
    }

    #[async_trait]
    impl BrokerLink for RecordingLink {
        async fn publish(&self, topic: &str, qos: QoS, payload: String) -> Result<()> {
            self.calls.lock().push(Call::Publish {
                topic: topic.to_string(),
                qos,
                payload,
            });
            Ok(())
        }

        async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
            self.calls.lock().push(Call::Subscribe {
                topic: topic.to_string(),
                qos,
            });
            Ok(())
        }
    }

    fn publisher() -> (Arc<SwitchPublisher>, Arc<RecordingLink>, mpsc::Receiver<Event>) {
        let link = Arc::new(RecordingLink::default());
        let (tx, rx) = mpsc::channel(16);
        let publisher = SwitchPublisher::new(
            link.clone(),
            TopicScheme::new("homeassistant", "switch", "myg"),
            tx,
        );
        (Arc::new(publisher), link, rx)
    }

    fn state(switch_id: &str, payload: &str) -> Call {
        Call::Publish {
            topic: format!("homeassistant/switch/myg/switch_{switch_id}/state"),
            qos: QoS::AtLeastOnce,
            payload: payload.to_string(),
        }
    }

    fn is_config(call: &Call, switch_id: &str) -> bool {
        matches!(call, Call::Publish { topic, qos: QoS::AtMostOnce, .. }
            if *topic == format!("homeassistant/switch/myg/switch_{switch_id}/config"))
    }

    fn subscribe(switch_id: &str) -> Call {
        Call::Subscribe {
            topic: format!("homeassistant/switch/myg/switch_{switch_id}/set"),
            qos: QoS::AtLeastOnce,
        }
    }

    #[tokio::test]
    async fn test_first_change_announces_then_publishes_state() {
        let (publisher, link, _rx) = publisher();
        publisher.apply_change("3", true).await;

        let calls = link.calls();
        assert_eq!(calls.len(), 3);
        assert!(is_config(&calls[0], "3"));
        assert_eq!(calls[1], subscribe("3"));
        assert_eq!(calls[2], state("3", "ON"));
    }

    #[tokio::test]
    async fn test_discovery_payload() {
        let (publisher, link, _rx) = publisher();
        publisher.apply_change("3", false).await;

        let calls = link.calls();
        let Call::Publish { payload, .. } = &calls[0] else {
            panic!("expected discovery publish first");
        };
        let config: DiscoveryConfig = serde_json::from_str(payload).unwrap();
        assert_eq!(
            config,
            DiscoveryConfig {
                name: "myg_switch_3".to_string(),
                command_topic: "homeassistant/switch/myg/switch_3/set".to_string(),
                state_topic: "homeassistant/switch/myg/switch_3/state".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_repeated_value_publishes_once() {
        let (publisher, link, _rx) = publisher();
        publisher.apply_change("1", true).await;
        publisher.apply_change("1", true).await;

        let states = link
            .calls()
            .into_iter()
            .filter(|call| *call == state("1", "ON"))
            .count();
        assert_eq!(states, 1);
        assert_eq!(publisher.cache().get("1"), Some(true));
    }

    #[tokio::test]
    async fn test_changed_value_publishes_state_only() {
        let (publisher, link, _rx) = publisher();
        publisher.apply_change("1", true).await;
        link.take();

        publisher.apply_change("1", false).await;
        assert_eq!(link.calls(), vec![state("1", "OFF")]);
    }

    #[tokio::test]
    async fn test_command_topic_becomes_broker_event() {
        let (publisher, _link, mut rx) = publisher();

        publisher
            .handle_message("homeassistant/switch/myg/switch_5/set", "OFF")
            .await;
        assert_eq!(rx.recv().await, Some(Event::broker("5", false)));

        publisher
            .handle_message("homeassistant/switch/myg/switch_2/set", "ON")
            .await;
        assert_eq!(rx.recv().await, Some(Event::broker("2", true)));

        publisher
            .handle_message("homeassistant/switch/myg/switch_2/set", "on")
            .await;
        assert_eq!(rx.recv().await, Some(Event::broker("2", false)));
    }

    #[tokio::test]
    async fn test_foreign_topic_is_ignored() {
        let (publisher, link, mut rx) = publisher();
        publisher
            .handle_message("homeassistant/switch/other/switch_5/set", "ON")
            .await;
        publisher
            .handle_message("homeassistant/switch/myg/switch_5/state", "ON")
            .await;

        assert!(rx.try_recv().is_err());
        assert!(link.calls().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_republishes_every_switch() {
        let (publisher, link, _rx) = publisher();
        publisher.apply_change("1", true).await;
        publisher.apply_change("2", false).await;
        link.take();

        publisher.refresh().await;
        let calls = link.calls();
        assert_eq!(calls.len(), 4);
        assert!(is_config(&calls[0], "1"));
        assert_eq!(calls[1], state("1", "ON"));
        assert!(is_config(&calls[2], "2"));
        assert_eq!(calls[3], state("2", "OFF"));
    }

    #[tokio::test]
    async fn test_reconnect_restores_subscriptions() {
        let (publisher, link, mut rx) = publisher();
        publisher.apply_change("4", true).await;
        link.take();

        let (tx, notifications) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let inbound = tokio::spawn(publisher.clone().run_inbound(notifications, cancel.clone()));

        tx.send(BrokerEvent::Connected).await.unwrap();
        tx.send(BrokerEvent::Message(MqttMessage {
            topic: "homeassistant/switch/myg/switch_4/set".to_string(),
            payload: "OFF".to_string(),
        }))
        .await
        .unwrap();
        assert_eq!(rx.recv().await, Some(Event::broker("4", false)));

        drop(tx);
        inbound.await.unwrap();

        let calls = link.calls();
        assert_eq!(calls[0], subscribe("4"));
        assert!(is_config(&calls[1], "4"));
        assert_eq!(calls[2], state("4", "ON"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_loop_runs_every_interval() {
        let (publisher, link, _rx) = publisher();
        publisher.apply_change("1", true).await;
        link.take();

        let cancel = CancellationToken::new();
        let refresh = tokio::spawn(publisher.clone().run_refresh(cancel.clone()));

        tokio::time::sleep(REFRESH_INTERVAL * 2 + Duration::from_secs(1)).await;
        cancel.cancel();
        refresh.await.unwrap();

        // Immediate first pass plus two intervals
        let states = link
            .calls()
            .into_iter()
            .filter(|call| *call == state("1", "ON"))
            .count();
        assert_eq!(states, 3);
    }
}
