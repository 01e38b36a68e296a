//! Home Assistant topic layout for the bridged relays.
//!
//! Every relay gets a base topic
//! `<prefix>/<deviceType>/<groupId>/<deviceType>_<switchId>` with
//! `/config`, `/state` and `/set` below it.

use crate::config::MqttConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    prefix: String,
    device_type: String,
    group_id: String,
}

impl TopicScheme {
    pub fn new(
        prefix: impl Into<String>,
        device_type: impl Into<String>,
        group_id: impl Into<String>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            device_type: device_type.into(),
            group_id: group_id.into(),
        }
    }

    pub fn from_config(config: &MqttConfig) -> Self {
        Self::new(&config.topic_prefix, &config.device_type, &config.group_id)
    }

    /// Everything up to and including `<deviceType>_`, shared by all relays.
    fn switch_prefix(&self) -> String {
        format!(
            "{}/{}/{}/{}_",
            self.prefix, self.device_type, self.group_id, self.device_type
        )
    }

    pub fn base(&self, switch_id: &str) -> String {
        format!("{}{}", self.switch_prefix(), switch_id)
    }

    pub fn config_topic(&self, switch_id: &str) -> String {
        format!("{}/config", self.base(switch_id))
    }

    pub fn state_topic(&self, switch_id: &str) -> String {
        format!("{}/state", self.base(switch_id))
    }

    pub fn command_topic(&self, switch_id: &str) -> String {
        format!("{}/set", self.base(switch_id))
    }

    /// Entity name shown in Home Assistant, e.g. `kc868_switch_3`.
    pub fn display_name(&self, switch_id: &str) -> String {
        format!("{}_{}_{}", self.group_id, self.device_type, switch_id)
    }

    /// Switch id addressed by a command topic of this scheme, if any.
    pub fn switch_id_from_command<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let switch_id = topic
            .strip_prefix(self.switch_prefix().as_str())?
            .strip_suffix("/set")?;
        if switch_id.is_empty() || switch_id.contains('/') {
            return None;
        }
        Some(switch_id)
    }
}
