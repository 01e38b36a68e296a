//! State-change events exchanged between the relay controller and the broker.

use std::fmt;

/// Side of the bridge on which a state change was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    /// Reported by the relay controller over TCP.
    Device,
    /// Commanded through an MQTT `.../set` topic.
    Broker,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Device => f.write_str("device"),
            Provider::Broker => f.write_str("broker"),
        }
    }
}

/// A single observed relay state change.
///
/// Created where the change is observed and consumed exactly once by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub provider: Provider,
    pub switch_id: String,
    pub on: bool,
}

impl Event {
    pub fn new(provider: Provider, switch_id: impl Into<String>, on: bool) -> Self {
        Self {
            provider,
            switch_id: switch_id.into(),
            on,
        }
    }

    pub fn device(switch_id: impl Into<String>, on: bool) -> Self {
        Self::new(Provider::Device, switch_id, on)
    }

    pub fn broker(switch_id: impl Into<String>, on: bool) -> Self {
        Self::new(Provider::Broker, switch_id, on)
    }
}
