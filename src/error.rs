use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum BridgeError {
    #[error("Relay controller is not connected")]
    DeviceNotConnected,

    #[error("MQTT client error: {0}")]
    MqttClient(#[from] rumqttc::ClientError),

    #[error("MQTT broker did not acknowledge the connection within {0:?}")]
    BrokerConnectTimeout(Duration),

    #[error("MQTT event loop stopped before the broker connection was established")]
    BrokerEventLoopClosed,

    #[error("Invalid config file {path}: {source}")]
    ConfigFile {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
