//! Broker transport seam
//!
//! [`BrokerTransport`] is the only place the bridge touches the MQTT client
//! library. The production implementation wraps a `rumqttc` [`AsyncClient`] and
//! runs its [`EventLoop`] in a dedicated pump task that turns network activity
//! into [`BrokerEvent`]s on an mpsc channel, so nothing in the bridge runs inside
//! library callbacks.
//!
//! ```text
//! EventLoop::poll ──► pump task ──► handshake (oneshot, first outcome only)
//!                               └─► BrokerEvent channel ──► ConnectionManager
//! ```
//!
//! Each `open` builds a fresh client and event loop. The pump stops at the first
//! error instead of letting rumqttc reconnect on its own, which leaves the retry
//! policy entirely to the connection manager.

use super::config::BrokerEndpoint;
use super::message_manager::{BrokerEvent, InboundMessage, OutboundMessage, WillMessage};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, LastWill, MqttOptions,
    Outgoing, Packet, QoS,
};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Resolves once with the outcome of the CONNECT/CONNACK exchange
pub type Handshake = oneshot::Receiver<Result<(), ConnectFailure>>;

const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Reason codes a broker can answer a CONNECT with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    ProtocolVersion,
    ClientId,
    ServiceUnavailable,
    BadCredentials,
    NotAuthorized,
    Unspecified,
}

impl RejectReason {
    /// Rejections that retrying cannot fix: wrong protocol version or bad credentials
    pub fn is_fatal(self) -> bool {
        matches!(self, RejectReason::ProtocolVersion | RejectReason::BadCredentials)
    }
}

impl From<&ConnectReturnCode> for RejectReason {
    #[allow(unreachable_patterns)]
    fn from(code: &ConnectReturnCode) -> Self {
        match code {
            ConnectReturnCode::RefusedProtocolVersion => RejectReason::ProtocolVersion,
            ConnectReturnCode::BadClientId => RejectReason::ClientId,
            ConnectReturnCode::ServiceUnavailable => RejectReason::ServiceUnavailable,
            ConnectReturnCode::BadUserNamePassword => RejectReason::BadCredentials,
            ConnectReturnCode::NotAuthorized => RejectReason::NotAuthorized,
            _ => RejectReason::Unspecified,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            RejectReason::ProtocolVersion => "invalid protocol version",
            RejectReason::ClientId => "invalid client identifier",
            RejectReason::ServiceUnavailable => "broker unavailable",
            RejectReason::BadCredentials => "bad username or password",
            RejectReason::NotAuthorized => "not authorized",
            RejectReason::Unspecified => "unspecified rejection",
        };
        write!(f, "{}", text)
    }
}

/// Why a connection attempt did not complete
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectFailure {
    #[error("DNS resolution failed: {0}")]
    Dns(String),

    #[error("Connection timed out")]
    Timeout,

    #[error("Connection refused: {0}")]
    Refused(String),

    #[error("Broker rejected connection: {0}")]
    Rejected(RejectReason),

    #[error("Network error: {0}")]
    Network(String),

    /// The transport went away before reporting an outcome
    #[error("Connection attempt aborted")]
    Aborted,
}

impl ConnectFailure {
    /// Fatal failures are configuration errors and are never retried
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectFailure::Rejected(reason) if reason.is_fatal())
    }
}

impl From<&ConnectionError> for ConnectFailure {
    fn from(err: &ConnectionError) -> Self {
        match err {
            ConnectionError::ConnectionRefused(code) => ConnectFailure::Rejected(code.into()),
            ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => {
                ConnectFailure::Timeout
            }
            ConnectionError::Io(io) => match io.kind() {
                std::io::ErrorKind::ConnectionRefused => ConnectFailure::Refused(io.to_string()),
                std::io::ErrorKind::TimedOut => ConnectFailure::Timeout,
                _ if looks_like_dns(&io.to_string()) => ConnectFailure::Dns(io.to_string()),
                _ => ConnectFailure::Network(io.to_string()),
            },
            other => ConnectFailure::Network(other.to_string()),
        }
    }
}

fn looks_like_dns(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("lookup") || message.contains("resolve") || message.contains("name or service")
}

/// Errors from requests on an established session
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("No active broker session")]
    NotConnected,

    #[error("Client request failed: {0}")]
    Client(String),
}

/// Per-session options handed to the transport on every `open`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub client_id: String,
    pub keep_alive: Duration,
    pub will: WillMessage,
    pub capacity: usize,
}

#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Starts a new session against `endpoint`.
    ///
    /// Returns as soon as the network task is running; the handshake outcome
    /// arrives on the returned receiver. After a successful handshake all
    /// further activity is reported on `events`.
    async fn open(
        &self,
        endpoint: &BrokerEndpoint,
        options: &SessionOptions,
        events: mpsc::Sender<BrokerEvent>,
    ) -> Result<Handshake, ConnectFailure>;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError>;

    /// Ends the current session, if any
    async fn close(&self) -> Result<(), TransportError>;
}

struct ActiveSession {
    client: AsyncClient,
    pump: JoinHandle<()>,
}

/// [`BrokerTransport`] backed by rumqttc (MQTT 3.1.1 over TCP)
#[derive(Default)]
pub struct RumqttcTransport {
    session: Mutex<Option<ActiveSession>>,
}

impl RumqttcTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn client(&self) -> Result<AsyncClient, TransportError> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.client.clone())
            .ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl BrokerTransport for RumqttcTransport {
    async fn open(
        &self,
        endpoint: &BrokerEndpoint,
        options: &SessionOptions,
        events: mpsc::Sender<BrokerEvent>,
    ) -> Result<Handshake, ConnectFailure> {
        let mut mqtt_options =
            MqttOptions::new(options.client_id.clone(), endpoint.host.clone(), endpoint.port);
        mqtt_options
            .set_keep_alive(options.keep_alive)
            .set_clean_session(true)
            .set_last_will(LastWill::new(
                options.will.topic.clone(),
                options.will.payload.clone(),
                options.will.qos,
                options.will.retain,
            ));
        if let (Some(user), Some(pw)) = (&endpoint.username, &endpoint.password) {
            mqtt_options.set_credentials(user.clone(), pw.clone());
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, options.capacity.max(1));
        let (handshake_tx, handshake_rx) = oneshot::channel();
        let pump = tokio::spawn(pump_events(eventloop, events, handshake_tx));
        debug!("Started network task for {}", endpoint);

        let mut guard = self.session.lock().await;
        if let Some(previous) = guard.replace(ActiveSession { client, pump }) {
            previous.pump.abort();
        }

        Ok(handshake_rx)
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.client()
            .await?
            .subscribe(topic, qos)
            .await
            .map_err(|e| TransportError::Client(e.to_string()))
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError> {
        self.client()
            .await?
            .publish(message.topic, message.qos, message.retain, message.payload)
            .await
            .map_err(|e| TransportError::Client(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let Some(mut session) = self.session.lock().await.take() else {
            return Ok(());
        };

        let result = session
            .client
            .disconnect()
            .await
            .map_err(|e| TransportError::Client(e.to_string()));

        if tokio::time::timeout(CLOSE_GRACE, &mut session.pump).await.is_err() {
            warn!("Network task did not stop within {:?}, aborting it", CLOSE_GRACE);
            session.pump.abort();
        }
        result
    }
}

// Drives one rumqttc event loop until the session ends.
async fn pump_events(
    mut eventloop: EventLoop,
    events: mpsc::Sender<BrokerEvent>,
    handshake: oneshot::Sender<Result<(), ConnectFailure>>,
) {
    let mut handshake = Some(handshake);

    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("CONNACK received (session present: {})", ack.session_present);
                if let Some(tx) = handshake.take() {
                    let _ = tx.send(Ok(()));
                }
                BrokerEvent::Connected
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let topic = String::from_utf8_lossy(AsRef::<[u8]>::as_ref(&publish.topic));
                BrokerEvent::Message(InboundMessage::new(topic, publish.payload.to_vec()))
            }
            Ok(Event::Incoming(Packet::Disconnect)) => BrokerEvent::Disconnected {
                graceful: false,
                reason: "broker closed the session".to_string(),
            },
            Ok(Event::Outgoing(Outgoing::Disconnect)) => BrokerEvent::Disconnected {
                graceful: true,
                reason: "client requested disconnect".to_string(),
            },
            Ok(other) => {
                trace!("MQTT event: {:?}", other);
                continue;
            }
            Err(err) => {
                let failure = ConnectFailure::from(&err);
                match handshake.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(failure));
                        return;
                    }
                    None => {
                        error!("MQTT network error: {}", err);
                        BrokerEvent::Disconnected {
                            graceful: false,
                            reason: err.to_string(),
                        }
                    }
                }
            }
        };

        let finished = matches!(event, BrokerEvent::Disconnected { .. });
        if events.send(event).await.is_err() {
            debug!("Event receiver dropped, stopping network task");
            return;
        }
        if finished {
            return;
        }
    }
}
