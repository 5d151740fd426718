//! Outbound control commands and their correlation records
//!
//! A command goes out on `{prefix}/command` carrying its `command_id` and the
//! `response_topic` the player should answer on. MQTT 3.1.1 has no message
//! properties, so both travel inside the JSON body. Until a response arrives
//! or the command timeout passes, the command stays in the pending table.

use super::config::MqttConfig;
use super::mqtt_handler::ConnectionManager;
use crate::error::ValidationError;
use crate::status::model::{json_kind, unix_now};
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Start,
    Stop,
    Pause,
    Resume,
    Restart,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Pause => "pause",
            Action::Resume => "resume",
            Action::Restart => "restart",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlCommand {
    pub action: Action,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl ControlCommand {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            parameters: Map::new(),
            command_id: None,
            timestamp: None,
        }
    }

    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        if !value.is_object() {
            return Err(ValidationError::Malformed(format!(
                "expected a JSON object, got {}",
                json_kind(&value)
            )));
        }
        let command: ControlCommand = serde_json::from_value(value)?;
        command.validate()?;
        Ok(command)
    }

    pub fn from_slice(payload: &[u8]) -> Result<Self, ValidationError> {
        let value: Value = serde_json::from_slice(payload)?;
        Self::from_value(value)
    }

    /// A caller-chosen id becomes a topic level, so it must be one
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(id) = &self.command_id {
            if id.is_empty() {
                return Err(ValidationError::OutOfRange {
                    field: "command_id",
                    reason: "must not be empty".to_string(),
                });
            }
            if id.contains(['/', '+', '#']) {
                return Err(ValidationError::OutOfRange {
                    field: "command_id",
                    reason: format!("'{}' contains topic separators or wildcards", id),
                });
            }
        }
        Ok(())
    }

    /// Returns the command id, generating `cmd_<hex>` first if none was given
    pub fn ensure_id(&mut self) -> &str {
        self.command_id.get_or_insert_with(generate_command_id)
    }
}

pub fn generate_command_id() -> String {
    format!("cmd_{}", uuid::Uuid::new_v4().simple())
}

/// A sent command still waiting for its response
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub command_id: String,
    pub action: Action,
    pub issued_at: Instant,
    pub response_topic: String,
}

#[derive(Serialize)]
struct CommandEnvelope<'a> {
    #[serde(flatten)]
    command: &'a ControlCommand,
    response_topic: &'a str,
}

pub struct CommandDispatcher {
    connection: Arc<ConnectionManager>,
    qos: QoS,
    retain: bool,
    timeout: Duration,
    pending: Mutex<HashMap<String, PendingCommand>>,
}

impl CommandDispatcher {
    pub fn new(connection: Arc<ConnectionManager>, config: &MqttConfig) -> Self {
        Self {
            connection,
            qos: config.qos(),
            retain: config.retain_commands,
            timeout: config.command_timeout(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingCommand>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publishes a command without waiting for its response.
    ///
    /// Returns `false` when the command could not be handed to the broker; the
    /// pending record is dropped in that case.
    pub async fn send(&self, mut command: ControlCommand) -> bool {
        let command_id = command.ensure_id().to_string();
        command.timestamp.get_or_insert_with(unix_now);
        let response_topic = self.connection.topics().response(&command_id);

        let envelope = CommandEnvelope {
            command: &command,
            response_topic: &response_topic,
        };
        let payload = match serde_json::to_vec(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode command {}: {}", command_id, e);
                return false;
            }
        };

        let record = PendingCommand {
            command_id: command_id.clone(),
            action: command.action,
            issued_at: Instant::now(),
            response_topic,
        };
        // Kept so a failed publish of the reused id does not orphan the first
        // command's response
        let displaced = self.pending().insert(command_id.clone(), record);
        if displaced.is_some() {
            warn!("Command id {} reused while still pending", command_id);
        }

        let topic = self.connection.topics().command();
        if self
            .connection
            .publish(topic, payload, self.qos, self.retain)
            .await
        {
            info!("Command sent: {} ({})", command.action, command_id);
            true
        } else {
            match displaced {
                Some(previous) => {
                    self.pending().insert(command_id.clone(), previous);
                }
                None => {
                    self.pending().remove(&command_id);
                }
            }
            error!("Failed to send command: {} ({})", command.action, command_id);
            false
        }
    }

    /// Removes the pending record for `command_id`; unknown ids are ignored
    pub fn resolve(&self, command_id: &str, payload: &Value) -> Option<PendingCommand> {
        let resolved = self.pending().remove(command_id);
        match &resolved {
            Some(pending) => info!(
                "Command response received: {} ({}) after {:?}: {}",
                pending.action,
                command_id,
                pending.issued_at.elapsed(),
                payload
            ),
            None => debug!("Response for unknown command {} discarded", command_id),
        }
        resolved
    }

    /// Drops pending records older than the command timeout, returning how many
    pub fn expire_stale(&self) -> usize {
        let timeout = self.timeout;
        let mut pending = self.pending();
        let before = pending.len();
        pending.retain(|id, record| {
            let alive = record.issued_at.elapsed() < timeout;
            if !alive {
                warn!(
                    "Command {} ({}) got no response within {:?}",
                    id, record.action, timeout
                );
            }
            alive
        });
        before - pending.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    pub fn is_pending(&self, command_id: &str) -> bool {
        self.pending().contains_key(command_id)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::BrokerEndpoint;
    use crate::mqtt::testing::{ScriptedTransport, Step};
    use serde_json::json;
    use tokio::sync::mpsc;

    async fn connected_dispatcher() -> (CommandDispatcher, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::new([Step::Accept]));
        let config = MqttConfig {
            broker: BrokerEndpoint::new("primary.local", 1883),
            ..MqttConfig::default()
        };
        let (tx, _rx) = mpsc::channel(16);
        let connection = ConnectionManager::spawn(config.clone(), transport.clone(), tx);
        connection.connect().await;
        (CommandDispatcher::new(connection, &config), transport)
    }

    #[test]
    fn parses_command_with_defaults() {
        let command = ControlCommand::from_slice(br#"{"action":"pause"}"#).unwrap();
        assert_eq!(command.action, Action::Pause);
        assert!(command.parameters.is_empty());
        assert!(command.command_id.is_none());
    }

    #[test]
    fn rejects_unknown_action_and_bad_ids() {
        assert!(matches!(
            ControlCommand::from_slice(br#"{"action":"explode"}"#),
            Err(ValidationError::InvalidField(_))
        ));
        assert!(matches!(
            ControlCommand::from_slice(br#"{"action":"stop","command_id":"a/b"}"#),
            Err(ValidationError::OutOfRange { field: "command_id", .. })
        ));
        assert!(matches!(
            ControlCommand::from_value(json!(["start"])),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn ensure_id_generates_once() {
        let mut command = ControlCommand::new(Action::Start);
        let first = command.ensure_id().to_string();
        assert!(first.starts_with("cmd_"));
        assert_eq!(command.ensure_id(), first);
    }

    #[tokio::test(start_paused = true)]
    async fn send_embeds_correlation_data() {
        let (dispatcher, transport) = connected_dispatcher().await;
        let mut command = ControlCommand::new(Action::Restart);
        command.parameters.insert("delay".into(), json!(3));
        command.command_id = Some("cmd_fixed".into());

        assert!(dispatcher.send(command).await);

        let sent = transport.published_on("loki/media/command");
        assert_eq!(sent.len(), 1);
        assert!(sent[0].retain);
        let body: Value = serde_json::from_slice(&sent[0].payload).unwrap();
        assert_eq!(body["action"], "restart");
        assert_eq!(body["command_id"], "cmd_fixed");
        assert_eq!(body["response_topic"], "loki/media/response/cmd_fixed");
        assert_eq!(body["parameters"]["delay"], 3);
        assert!(body["timestamp"].is_i64());
        assert!(dispatcher.is_pending("cmd_fixed"));
    }

    #[tokio::test(start_paused = true)]
    async fn two_commands_resolve_independently() {
        let (dispatcher, transport) = connected_dispatcher().await;
        assert!(dispatcher.send(ControlCommand::new(Action::Start)).await);
        assert!(dispatcher.send(ControlCommand::new(Action::Stop)).await);

        let topics: Vec<String> = transport
            .published_on("loki/media/command")
            .iter()
            .map(|m| {
                let body: Value = serde_json::from_slice(&m.payload).unwrap();
                body["response_topic"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(topics.len(), 2);
        assert_ne!(topics[0], topics[1]);

        let first_id = topics[0].rsplit('/').next().unwrap().to_string();
        let second_id = topics[1].rsplit('/').next().unwrap().to_string();
        assert!(dispatcher.resolve(&first_id, &json!({"ok": true})).is_some());
        assert!(!dispatcher.is_pending(&first_id));
        assert!(dispatcher.is_pending(&second_id));
        assert_eq!(dispatcher.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_publish_drops_pending_record() {
        let (dispatcher, transport) = connected_dispatcher().await;
        transport.reject_publishes(true);

        let mut command = ControlCommand::new(Action::Stop);
        command.command_id = Some("cmd_lost".into());
        assert!(!dispatcher.send(command).await);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_resend_of_pending_id_keeps_first_command() {
        let (dispatcher, transport) = connected_dispatcher().await;
        let mut first = ControlCommand::new(Action::Start);
        first.command_id = Some("cmd_dup".into());
        assert!(dispatcher.send(first).await);

        transport.reject_publishes(true);
        let mut second = ControlCommand::new(Action::Stop);
        second.command_id = Some("cmd_dup".into());
        assert!(!dispatcher.send(second).await);

        assert_eq!(dispatcher.pending_count(), 1);
        let restored = dispatcher.resolve("cmd_dup", &json!({"result": "ok"})).unwrap();
        assert_eq!(restored.action, Action::Start);
    }

    #[tokio::test(start_paused = true)]
    async fn unmatched_response_is_a_no_op() {
        let (dispatcher, _transport) = connected_dispatcher().await;
        assert!(dispatcher.send(ControlCommand::new(Action::Pause)).await);
        assert!(dispatcher.resolve("cmd_unknown", &json!({})).is_none());
        assert_eq!(dispatcher.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_commands_expire() {
        let (dispatcher, _transport) = connected_dispatcher().await;
        assert!(dispatcher.send(ControlCommand::new(Action::Start)).await);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(dispatcher.expire_stale(), 0);

        tokio::time::advance(dispatcher.timeout()).await;
        assert_eq!(dispatcher.expire_stale(), 1);
        assert_eq!(dispatcher.pending_count(), 0);
    }
}
