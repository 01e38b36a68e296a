//! Broker side of the bridge: MQTT connection, topic layout, switch state
//! cache and the publisher that ties them together.

pub mod client;
pub mod publisher;
pub mod state;
pub mod topics;

pub use client::{BrokerEvent, MqttClient, MqttMessage};
pub use publisher::{BrokerLink, DiscoveryConfig, SwitchPublisher};
pub use state::{SwitchState, SwitchStateCache};
pub use topics::TopicScheme;
