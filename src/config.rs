use crate::mqtt::config::MqttConfig;
use crate::status::DEFAULT_HISTORY_CAPACITY;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CONFIG_DIR_NAME: &str = "loki-bridge";
const CONFIG_FILE: &str = "bridge.toml";
const MIN_KEEP_ALIVE_SECS: u64 = 5;

pub const ENV_BROKER: &str = "MQTT_BROKER";
pub const ENV_PORT: &str = "MQTT_PORT";
pub const ENV_TOPIC_PREFIX: &str = "MQTT_TOPIC_PREFIX";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

/// Complete bridge configuration as read from `bridge.toml`.
///
/// Every section is optional in the file; missing keys take their defaults.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub mqtt: MqttConfig,
    pub http: HttpConfig,
    pub history_capacity: usize,
    /// How often pending commands are checked for expiry
    pub sweep_interval_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig::default(),
            http: HttpConfig::default(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            sweep_interval_secs: 5,
        }
    }
}

impl BridgeConfig {
    /// Default location: `<config dir>/loki-bridge/bridge.toml`, falling back
    /// to the home directory when the platform has no config dir
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE))
    }

    /// Loads the file if present, applies environment overrides and validates.
    ///
    /// An explicitly given path must exist; a missing default file just means
    /// defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path).await?,
            None => Self::load_default_file().await?,
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    async fn load_default_file() -> Result<Self> {
        let Some(path) = Self::default_path() else {
            info!("No config directory available, using defaults");
            return Ok(Self::default());
        };
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|e| eyre!("Failed to check config file {}: {}", path.display(), e))?;
        if exists {
            Self::from_file(&path).await
        } else {
            info!("No config file at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config: BridgeConfig = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Applies `MQTT_BROKER`, `MQTT_PORT` and `MQTT_TOPIC_PREFIX`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup(ENV_BROKER) {
            debug!("{} overrides broker host: {}", ENV_BROKER, host);
            self.mqtt.broker.host = host;
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.mqtt.broker.port = port
                .trim()
                .parse()
                .map_err(|e| eyre!("Invalid {} '{}': {}", ENV_PORT, port, e))?;
            debug!("{} overrides broker port: {}", ENV_PORT, self.mqtt.broker.port);
        }
        if let Some(prefix) = lookup(ENV_TOPIC_PREFIX) {
            debug!("{} overrides topic prefix: {}", ENV_TOPIC_PREFIX, prefix);
            self.mqtt.topic_prefix = prefix;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mqtt = &self.mqtt;
        if mqtt.topic_prefix.trim_matches('/').is_empty() {
            return Err(eyre!("mqtt.topic_prefix must not be empty"));
        }
        if mqtt.topic_prefix.contains(['+', '#']) {
            return Err(eyre!(
                "mqtt.topic_prefix must not contain wildcards: {}",
                mqtt.topic_prefix
            ));
        }
        if mqtt.broker.host.trim().is_empty() {
            return Err(eyre!("mqtt.broker.host must not be empty"));
        }
        if let Some(fallback) = &mqtt.fallback {
            if fallback.host.trim().is_empty() {
                return Err(eyre!("mqtt.fallback.host must not be empty"));
            }
        }
        if mqtt.qos > 2 {
            return Err(eyre!("mqtt.qos must be 0, 1 or 2, got {}", mqtt.qos));
        }
        if mqtt.max_reconnect_attempts == 0 {
            return Err(eyre!("mqtt.max_reconnect_attempts must be at least 1"));
        }
        if mqtt.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            return Err(eyre!(
                "mqtt.keep_alive_secs must be at least {}",
                MIN_KEEP_ALIVE_SECS
            ));
        }
        if mqtt.channel_capacity == 0 {
            return Err(eyre!("mqtt.channel_capacity must be at least 1"));
        }
        if self.history_capacity == 0 {
            return Err(eyre!("history_capacity must be at least 1"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(eyre!("sweep_interval_secs must be at least 1"));
        }
        if mqtt.fallback.is_none() {
            warn!("No fallback broker configured");
        }
        Ok(())
    }
}
