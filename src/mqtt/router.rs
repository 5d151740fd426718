use super::dispatcher::CommandDispatcher;
use super::message_manager::InboundMessage;
use super::topics::{TopicKind, TopicLayout};
use crate::status::{StatusSnapshot, StatusStore};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// What happened to one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    StatusStored,
    /// Status payload failed validation and was dropped
    StatusRejected,
    /// Our own status snapshot coming back through the subscription
    StatusEcho,
    /// Online/offline announcement on a status topic
    Presence,
    ResponseMatched,
    ResponseUnmatched,
    /// Under the prefix but not handled (control and command echoes)
    Observed,
    Malformed,
    Foreign,
}

/// Status payloads published by this process that have not come back yet
const PENDING_ECHO_LIMIT: usize = 32;

/// Status payloads we republished and expect to see again on our own
/// subscription. Each entry suppresses exactly one identical inbound message.
#[derive(Debug, Default)]
pub struct PendingEchoes {
    payloads: Mutex<VecDeque<Vec<u8>>>,
}

impl PendingEchoes {
    fn lock(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.payloads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a payload about to be published, dropping the oldest entry once
    /// the queue is full
    pub fn expect(&self, payload: &[u8]) {
        let mut payloads = self.lock();
        payloads.push_back(payload.to_vec());
        while payloads.len() > PENDING_ECHO_LIMIT {
            payloads.pop_front();
        }
    }

    /// Removes one entry equal to `payload`; `true` if there was one
    pub fn take(&self, payload: &[u8]) -> bool {
        let mut payloads = self.lock();
        match payloads.iter().position(|p| p.as_slice() == payload) {
            Some(index) => {
                payloads.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Classifies inbound broker messages by topic and hands them to the store or
/// the dispatcher. Never fails; bad input is logged and dropped.
pub struct MessageRouter {
    topics: TopicLayout,
    store: Arc<StatusStore>,
    dispatcher: Arc<CommandDispatcher>,
    echoes: Arc<PendingEchoes>,
}

impl MessageRouter {
    pub fn new(
        topics: TopicLayout,
        store: Arc<StatusStore>,
        dispatcher: Arc<CommandDispatcher>,
    ) -> Self {
        Self {
            topics,
            store,
            dispatcher,
            echoes: Arc::new(PendingEchoes::default()),
        }
    }

    /// Shared queue of our own status publishes; whoever publishes on the
    /// status topic records the payload here first
    pub fn echoes(&self) -> Arc<PendingEchoes> {
        self.echoes.clone()
    }

    pub fn route(&self, message: &InboundMessage) -> RouteOutcome {
        let kind = self.topics.classify(&message.topic);
        if kind == TopicKind::Foreign {
            debug!("Ignoring message outside {}: {}", self.topics.prefix(), message.topic);
            return RouteOutcome::Foreign;
        }

        let value: Value = match serde_json::from_slice(&message.payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    "JSON parsing failed - Topic: {}, Error: {}, Content: {}",
                    message.topic,
                    e,
                    message.preview()
                );
                return RouteOutcome::Malformed;
            }
        };

        match kind {
            TopicKind::Status => self.route_status(message, value),
            TopicKind::Response { command_id } => {
                match self.dispatcher.resolve(command_id, &value) {
                    Some(_) => RouteOutcome::ResponseMatched,
                    None => RouteOutcome::ResponseUnmatched,
                }
            }
            _ => {
                debug!("Observed {}: {}", message.topic, message.preview());
                RouteOutcome::Observed
            }
        }
    }

    fn route_status(&self, message: &InboundMessage, value: Value) -> RouteOutcome {
        if self.echoes.take(&message.payload) {
            debug!("Status echo on {} ignored", message.topic);
            return RouteOutcome::StatusEcho;
        }

        if let Some(presence) = presence_of(&value) {
            let client = value.get("client_id").and_then(Value::as_str).unwrap_or("?");
            info!("Client {} is {} ({})", client, presence, message.topic);
            return RouteOutcome::Presence;
        }

        match StatusSnapshot::from_value(value) {
            Ok(snapshot) => {
                self.store.update(snapshot);
                RouteOutcome::StatusStored
            }
            Err(e) => {
                warn!(
                    "Error processing status update from {}: {}. Raw data: {}",
                    message.topic,
                    e,
                    message.preview()
                );
                RouteOutcome::StatusRejected
            }
        }
    }
}

fn presence_of(value: &Value) -> Option<&str> {
    match value.get("status").and_then(Value::as_str) {
        Some(state @ ("online" | "offline")) => Some(state),
        _ => None,
    }
}
