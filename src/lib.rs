//! KC868 relay controller to MQTT bridge.
//!
//! Keeps the relays of a KC868 controller (TCP text protocol) and their
//! Home Assistant entities (MQTT discovery) in sync in both directions.

pub mod bridge;
pub mod config;
pub mod error;
pub mod event;
pub mod mqtt;
pub mod relay;
pub mod router;

pub use bridge::Bridge;
pub use config::Config;
pub use error::{BridgeError, Result};
pub use event::{Event, Provider};
