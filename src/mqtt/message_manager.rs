use chrono::{DateTime, Local};
use rumqttc::QoS;
use std::fmt;

const PREVIEW_LEN: usize = 100;

/// A message received from the broker, handed from the connection event loop to
/// the router over an mpsc channel.
#[derive(Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Local>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        InboundMessage {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Local::now(),
        }
    }

    /// Lossy UTF-8 view of the payload, cut to a loggable length
    pub fn preview(&self) -> String {
        preview(&self.payload)
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("topic", &self.topic)
            .field("payload", &self.preview())
            .field("received_at", &self.received_at)
            .finish()
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} ({} bytes)",
            self.received_at.format("%H:%M:%S%.3f"),
            self.topic,
            self.payload.len()
        )
    }
}

pub fn preview(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    if text.chars().count() <= PREVIEW_LEN {
        text.into_owned()
    } else {
        let cut: String = text.chars().take(PREVIEW_LEN).collect();
        format!("{cut}...")
    }
}

/// A publish request going out to the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Message the broker publishes for us when we drop off without a clean disconnect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Events delivered by a transport after its handshake completed.
///
/// Handshake failures never show up here; they are reported through the
/// handshake receiver returned by `BrokerTransport::open`.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    /// Broker accepted the connection
    Connected,
    Message(InboundMessage),
    /// Session ended. `graceful` is true only for a disconnect we requested.
    Disconnected { graceful: bool, reason: String },
}
