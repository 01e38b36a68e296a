use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Prefix shared by every configuration environment variable.
pub const ENV_PREFIX: &str = "APPLICATION_";

/// Log level used when none (or an invalid one) is configured.
pub const DEFAULT_LOG_LEVEL: &str = "error";

/// File looked up in each of [`config_search_dirs`].
pub const CONFIG_FILE_NAME: &str = "config.toml";

const APP_DIR: &str = "kc868-mqtt-transport";

/// Settings read from a config file, keyed by lowercase setting name
/// (`kc868_host`, `mqtt_topic_group_id`, ...).
pub type FileSettings = toml::Table;

/// Directories searched for [`CONFIG_FILE_NAME`], in order:
/// `/etc/kc868-mqtt-transport`, `~/.config/kc868-mqtt-transport`, then the
/// working directory.
pub fn config_search_dirs() -> Vec<PathBuf> {
    let mut search = vec![Path::new("/etc").join(APP_DIR)];
    if let Some(home) = dirs::home_dir() {
        search.push(home.join(".config").join(APP_DIR));
    }
    search.push(PathBuf::from("."));
    search
}

/// First existing config file in `dirs`.
pub fn find_config_file(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .find(|path| path.is_file())
}

pub fn read_config_file(path: &Path) -> Result<FileSettings> {
    let content = fs::read_to_string(path)?;
    parse_config_file(&content).map_err(|source| BridgeError::ConfigFile {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_config_file(content: &str) -> std::result::Result<FileSettings, toml::de::Error> {
    toml::from_str(content)
}

/// Value of `name` in a config file, rendered as the env var would be.
fn file_value(file: &FileSettings, name: &str) -> Option<String> {
    match file.get(&name.to_lowercase())? {
        toml::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Load `KEY=value` pairs from a dotenv-style file into the process environment.
///
/// Values may contain spaces without quoting; surrounding quotes are stripped.
/// Variables already present in the environment are left untouched.
/// Returns the number of variables that were set.
pub fn load_env_file(path: &Path) -> usize {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return 0,
    };

    let mut loaded = 0;
    for (key, value) in parse_env_lines(&content) {
        if std::env::var(key).is_err() {
            // SAFETY: called from main before the async runtime spawns any threads
            unsafe { std::env::set_var(key, value) };
            loaded += 1;
        }
    }
    loaded
}

fn parse_env_lines(content: &str) -> Vec<(&str, &str)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let mut value = value.trim();
            if value.len() >= 2
                && ((value.starts_with('"') && value.ends_with('"'))
                    || (value.starts_with('\'') && value.ends_with('\'')))
            {
                value = &value[1..value.len() - 1];
            }
            Some((key.trim(), value))
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    pub mqtt: MqttConfig,
    pub log_level: String,
}

/// Relay controller TCP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Label used in log lines.
    pub name: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Discovery prefix, `homeassistant` for a stock Home Assistant install.
    pub topic_prefix: String,
    /// Home Assistant component type the relays are exposed as.
    pub device_type: String,
    pub group_id: String,
}

impl MqttConfig {
    /// Credentials are only used when both halves are present.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some((username.as_str(), password.as_str())),
            _ => None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig {
                name: "kc868".to_string(),
                host: "192.168.0.100".to_string(),
                port: 4196,
            },
            mqtt: MqttConfig {
                broker_host: "192.168.0.2".to_string(),
                broker_port: 1883,
                client_id: "kc868-mqtt-transport".to_string(),
                username: None,
                password: None,
                topic_prefix: "homeassistant".to_string(),
                device_type: "switch".to_string(),
                group_id: "kc868".to_string(),
            },
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl Config {
    /// Resolve settings from the process environment over `file`.
    pub fn from_env(file: Option<&FileSettings>) -> Self {
        Self::from_sources(|key| std::env::var(key).ok(), file)
    }

    /// Resolve every setting from `APPLICATION_*` keys in `env`, then from
    /// the lowercase key in `file`, then the default.
    pub fn from_sources(env: impl Fn(&str) -> Option<String>, file: Option<&FileSettings>) -> Self {
        Self::from_lookup(|name| {
            env(format!("{ENV_PREFIX}{name}").as_str())
                .or_else(|| file.and_then(|file| file_value(file, name)))
        })
    }

    /// Build a configuration from setting names (`KC868_HOST`, ...) resolved
    /// by `get`.
    ///
    /// Missing keys keep their defaults; unparseable ports are ignored.
    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(name) = get("KC868_NAME") {
            config.device.name = name;
        }
        if let Some(host) = get("KC868_HOST") {
            config.device.host = host;
        }
        if let Some(port) = get("KC868_PORT")
            && let Ok(p) = port.parse()
        {
            config.device.port = p;
        }

        if let Some(host) = get("MQTT_SERVER_HOST") {
            config.mqtt.broker_host = host;
        }
        if let Some(port) = get("MQTT_SERVER_PORT")
            && let Ok(p) = port.parse()
        {
            config.mqtt.broker_port = p;
        }
        config.mqtt.username = get("MQTT_SERVER_USERNAME").filter(|u| !u.is_empty());
        config.mqtt.password = get("MQTT_SERVER_PASSWORD").filter(|p| !p.is_empty());
        if let Some(client_id) = get("MQTT_CLIENT_ID") {
            config.mqtt.client_id = client_id;
        }
        if let Some(prefix) = get("MQTT_TOPIC_PREFIX") {
            config.mqtt.topic_prefix = prefix;
        }
        if let Some(device_type) = get("MQTT_TOPIC_DEVICE_TYPE") {
            config.mqtt.device_type = device_type;
        }
        if let Some(group_id) = get("MQTT_TOPIC_GROUP_ID") {
            config.mqtt.group_id = group_id;
        }

        if let Some(level) = get("LOG_LEVEL") {
            config.log_level = level;
        }

        config
    }
}
