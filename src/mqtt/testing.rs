//! In-memory broker transport for tests

use super::config::BrokerEndpoint;
use super::message_manager::{BrokerEvent, InboundMessage, OutboundMessage, WillMessage};
use super::transport::{BrokerTransport, ConnectFailure, Handshake, SessionOptions, TransportError};
use async_trait::async_trait;
use rumqttc::QoS;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// How the scripted broker answers the next `open`
#[derive(Debug, Clone)]
pub enum Step {
    Accept,
    Fail(ConnectFailure),
    /// Leave the handshake unresolved until `finish_hanging` is called
    Hang,
}

/// Broker stand-in that answers connection attempts from a script and records
/// everything the bridge sends. An empty script refuses connections.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Step>>,
    opens: Mutex<Vec<(BrokerEndpoint, Instant)>>,
    wills: Mutex<Vec<WillMessage>>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    published: Mutex<Vec<OutboundMessage>>,
    events: Mutex<Option<mpsc::Sender<BrokerEvent>>>,
    hanging: Mutex<Option<oneshot::Sender<Result<(), ConnectFailure>>>>,
    reject_publish: AtomicBool,
    closes: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        let transport = Self::default();
        transport.push_steps(steps);
        transport
    }

    pub fn push_steps(&self, steps: impl IntoIterator<Item = Step>) {
        self.script.lock().unwrap().extend(steps);
    }

    pub fn open_count(&self) -> usize {
        self.opens.lock().unwrap().len()
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.opens.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }

    pub fn opened_endpoints(&self) -> Vec<BrokerEndpoint> {
        self.opens.lock().unwrap().iter().map(|(e, _)| e.clone()).collect()
    }

    pub fn last_will(&self) -> Option<WillMessage> {
        self.wills.lock().unwrap().last().cloned()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn published(&self) -> Vec<OutboundMessage> {
        self.published.lock().unwrap().clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<OutboundMessage> {
        self.published().into_iter().filter(|m| m.topic == topic).collect()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn reject_publishes(&self, reject: bool) {
        self.reject_publish.store(reject, Ordering::SeqCst);
    }

    fn events(&self) -> Option<mpsc::Sender<BrokerEvent>> {
        self.events.lock().unwrap().clone()
    }

    /// Simulates the network dropping an established session
    pub async fn drop_connection(&self) {
        if let Some(events) = self.events() {
            let _ = events
                .send(BrokerEvent::Disconnected {
                    graceful: false,
                    reason: "connection reset by peer".to_string(),
                })
                .await;
        }
    }

    /// Delivers a message as if the broker had routed it to us
    pub async fn deliver(&self, topic: &str, payload: &[u8]) {
        if let Some(events) = self.events() {
            let _ = events
                .send(BrokerEvent::Message(InboundMessage::new(topic, payload.to_vec())))
                .await;
        }
    }

    /// Resolves a handshake left open by [`Step::Hang`]
    pub async fn finish_hanging(&self, outcome: Result<(), ConnectFailure>) {
        let tx = self.hanging.lock().unwrap().take();
        if let Some(tx) = tx {
            let accepted = outcome.is_ok();
            let _ = tx.send(outcome);
            if accepted {
                if let Some(events) = self.events() {
                    let _ = events.send(BrokerEvent::Connected).await;
                }
            }
        }
    }
}

#[async_trait]
impl BrokerTransport for ScriptedTransport {
    async fn open(
        &self,
        endpoint: &BrokerEndpoint,
        options: &SessionOptions,
        events: mpsc::Sender<BrokerEvent>,
    ) -> Result<Handshake, ConnectFailure> {
        self.opens.lock().unwrap().push((endpoint.clone(), Instant::now()));
        self.wills.lock().unwrap().push(options.will.clone());
        *self.events.lock().unwrap() = Some(events.clone());

        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Step::Fail(ConnectFailure::Refused("script exhausted".into())));

        let (tx, rx) = oneshot::channel();
        match step {
            Step::Accept => {
                let _ = tx.send(Ok(()));
                let _ = events.send(BrokerEvent::Connected).await;
            }
            Step::Fail(failure) => {
                let _ = tx.send(Err(failure));
            }
            Step::Hang => {
                *self.hanging.lock().unwrap() = Some(tx);
            }
        }
        Ok(rx)
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.subscriptions.lock().unwrap().push((topic.to_string(), qos));
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError> {
        if self.reject_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Client("request queue closed".into()));
        }
        self.published.lock().unwrap().push(message);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        let events = self.events.lock().unwrap().take();
        if let Some(events) = events {
            let _ = events
                .send(BrokerEvent::Disconnected {
                    graceful: true,
                    reason: "client requested disconnect".to_string(),
                })
                .await;
        }
        Ok(())
    }
}
