use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_TOPIC_PREFIX: &str = "loki/media";
pub const DEFAULT_BROKER_HOST: &str = "test.mosquitto.org";
pub const FALLBACK_BROKER_HOST: &str = "broker.hivemq.com";
pub const DEFAULT_BROKER_PORT: u16 = 1883;

/// Address and optional credentials of one broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl BrokerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Broker connection and topic settings.
///
/// Defaults mirror the deployed media player: public test broker with a
/// HiveMQ fallback, QoS 1, retained status, 60s keepalive, five reconnect
/// attempts starting at one second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker: BrokerEndpoint,
    /// Tried once when the primary broker cannot be reached
    pub fallback: Option<BrokerEndpoint>,
    pub client_id_prefix: String,
    pub keep_alive_secs: u64,
    /// Upper bound for a single foreground connection attempt
    pub connect_timeout_secs: u64,
    pub topic_prefix: String,
    pub qos: u8,
    pub retain_status: bool,
    pub retain_commands: bool,
    pub reconnect_base_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    /// Pending commands older than this are dropped
    pub command_timeout_secs: u64,
    /// Capacity of the rumqttc request queue and of the inbound event channel
    pub channel_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: BrokerEndpoint::new(DEFAULT_BROKER_HOST, DEFAULT_BROKER_PORT),
            fallback: Some(BrokerEndpoint::new(FALLBACK_BROKER_HOST, DEFAULT_BROKER_PORT)),
            client_id_prefix: "loki_media_player".to_string(),
            keep_alive_secs: 60,
            connect_timeout_secs: 5,
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            qos: 1,
            retain_status: true,
            retain_commands: true,
            reconnect_base_delay_ms: 1000,
            max_reconnect_attempts: 5,
            command_timeout_secs: 30,
            channel_capacity: 100,
        }
    }
}

impl MqttConfig {
    pub fn qos(&self) -> QoS {
        qos_from_level(self.qos)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Maps a numeric QoS level to rumqttc's enum, clamping anything above 2
pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}
