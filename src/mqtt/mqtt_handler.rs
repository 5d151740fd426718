//! Broker connection lifecycle
//!
//! [`ConnectionManager`] keeps exactly one logical session with the broker.
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──► Connected
//!      ▲                          │              │ unexpected loss
//!      │ fatal / exhausted        ▼              ▼
//!      └────────────────────── Reconnecting ◄────┘
//!                                  │ success
//!                                  └──────────► Connected
//! ```
//!
//! Broker activity arrives as [`BrokerEvent`]s on a channel consumed by one
//! event-loop task. Reconnection runs in its own task with exponential backoff
//! (`base * 2^attempt`) and stops early when the manager is disconnected, since
//! every backoff sleep races a [`CancellationToken`].

use super::config::{BrokerEndpoint, MqttConfig};
use super::message_manager::{BrokerEvent, InboundMessage, OutboundMessage, WillMessage};
use super::topics::TopicLayout;
use super::transport::{BrokerTransport, ConnectFailure, Handshake, SessionOptions};
use rumqttc::QoS;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Result of a foreground [`ConnectionManager::connect`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    /// The handshake did not finish within the wait bound; the network task
    /// keeps running and may still connect
    Pending,
    Failed(ConnectFailure),
}

/// `base * 2^attempt`, saturating
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
}

pub struct ConnectionManager {
    config: MqttConfig,
    topics: TopicLayout,
    client_id: String,
    transport: Arc<dyn BrokerTransport>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: mpsc::Sender<BrokerEvent>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    // Broker of the last successful session, reconnects go back to it
    active_endpoint: Mutex<BrokerEndpoint>,
    // Cleared by disconnect(); late handshakes are ignored while false
    wanted: AtomicBool,
    reconnect_in_flight: AtomicBool,
    reconnect_attempts: AtomicU32,
    state_transitions: AtomicU64,
    reconnect_token: Mutex<CancellationToken>,
    lifetime: CancellationToken,
}

impl ConnectionManager {
    /// Creates the manager and spawns its event loop. Must be called inside a
    /// tokio runtime.
    pub fn spawn(
        config: MqttConfig,
        transport: Arc<dyn BrokerTransport>,
        inbound_tx: mpsc::Sender<InboundMessage>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let client_id = generate_client_id(&config.client_id_prefix);
        info!("MQTT client id: {}", client_id);

        let manager = Arc::new(Self {
            topics: TopicLayout::new(&config.topic_prefix),
            active_endpoint: Mutex::new(config.broker.clone()),
            config,
            client_id,
            transport,
            state_tx,
            events_tx,
            inbound_tx,
            wanted: AtomicBool::new(false),
            reconnect_in_flight: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
            state_transitions: AtomicU64::new(0),
            reconnect_token: Mutex::new(CancellationToken::new()),
            lifetime: CancellationToken::new(),
        });

        tokio::spawn(run_event_loop(
            Arc::downgrade(&manager),
            events_rx,
            manager.lifetime.clone(),
        ));

        manager
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn topics(&self) -> &TopicLayout {
        &self.topics
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Reconnect attempts made since the last successful connection
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Acquire)
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!("Connection state: {:?} -> {:?}", current, next);
            *current = next;
            true
        });
        if changed {
            self.state_transitions.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Number of state changes since the manager was created
    pub fn state_transitions(&self) -> u64 {
        self.state_transitions.load(Ordering::Acquire)
    }

    fn current_reconnect_token(&self) -> CancellationToken {
        self.reconnect_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn session_options(&self) -> SessionOptions {
        let will_payload = serde_json::json!({
            "status": "offline",
            "client_id": self.client_id,
        });
        SessionOptions {
            client_id: self.client_id.clone(),
            keep_alive: self.config.keep_alive(),
            will: WillMessage {
                topic: self.topics.offline().to_string(),
                payload: will_payload.to_string().into_bytes(),
                qos: self.config.qos(),
                retain: true,
            },
            capacity: self.config.channel_capacity,
        }
    }

    /// Connects to the primary broker, falling back once to the secondary.
    ///
    /// Each attempt waits at most `connect_timeout`. A timed-out attempt returns
    /// [`ConnectOutcome::Pending`] and keeps running in the background. When both
    /// brokers fail with a retryable error, background reconnection is scheduled
    /// before `Failed` is returned.
    pub async fn connect(self: &Arc<Self>) -> ConnectOutcome {
        if self.is_connected() {
            return ConnectOutcome::Connected;
        }
        self.wanted.store(true, Ordering::Release);
        self.set_state(ConnectionState::Connecting);

        let mut endpoints = vec![self.config.broker.clone()];
        endpoints.extend(self.config.fallback.clone());

        let mut last_failure = ConnectFailure::Aborted;
        for (idx, endpoint) in endpoints.iter().enumerate() {
            if idx > 0 {
                info!("Trying alternative MQTT broker: {}", endpoint);
            }

            let mut handshake = match self.open_session(endpoint).await {
                Ok(handshake) => handshake,
                Err(failure) => {
                    error!("Failed to connect to MQTT broker {}: {}", endpoint, failure);
                    last_failure = failure;
                    continue;
                }
            };

            let waited = tokio::time::timeout(self.config.connect_timeout(), &mut handshake).await;
            match waited {
                Ok(result) => match flatten_handshake(result) {
                    Ok(()) => {
                        self.mark_connected(endpoint);
                        return ConnectOutcome::Connected;
                    }
                    Err(failure) => {
                        error!("MQTT connection to {} failed: {}", endpoint, failure);
                        last_failure = failure;
                    }
                },
                Err(_) => {
                    warn!(
                        "MQTT connection to {} timed out after {:?}, continuing in the background",
                        endpoint,
                        self.config.connect_timeout()
                    );
                    self.watch_pending(handshake, endpoint.clone());
                    return ConnectOutcome::Pending;
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        if last_failure.is_fatal() {
            error!(
                "MQTT broker rejected the connection ({}); not retrying, check configuration",
                last_failure
            );
        } else {
            info!("Will attempt to reconnect in the background...");
            self.schedule_reconnect();
        }
        ConnectOutcome::Failed(last_failure)
    }

    async fn open_session(&self, endpoint: &BrokerEndpoint) -> Result<Handshake, ConnectFailure> {
        info!("Connecting to MQTT broker at {}...", endpoint);
        self.transport
            .open(endpoint, &self.session_options(), self.events_tx.clone())
            .await
    }

    fn mark_connected(&self, endpoint: &BrokerEndpoint) {
        *self
            .active_endpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = endpoint.clone();
        self.reconnect_attempts.store(0, Ordering::Release);
        self.set_state(ConnectionState::Connected);
        info!("Connected to MQTT broker {} (client id: {})", endpoint, self.client_id);
    }

    // Follows a handshake that outlived the foreground wait bound.
    fn watch_pending(self: &Arc<Self>, handshake: Handshake, endpoint: BrokerEndpoint) {
        let manager = Arc::clone(self);
        let token = self.current_reconnect_token();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = handshake => flatten_handshake(result),
            };
            match result {
                Ok(()) => manager.mark_connected(&endpoint),
                Err(failure) if failure.is_fatal() => {
                    error!("Background MQTT connection rejected: {}", failure);
                    manager.set_state(ConnectionState::Disconnected);
                }
                Err(failure) => {
                    warn!("Background MQTT connection failed: {}", failure);
                    manager.set_state(ConnectionState::Disconnected);
                    manager.schedule_reconnect();
                }
            }
        });
    }

    /// Starts the background reconnect loop unless one is already running.
    ///
    /// Returns immediately; `false` means a reconnect was already in flight.
    pub fn schedule_reconnect(self: &Arc<Self>) -> bool {
        if self
            .reconnect_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Reconnect already in progress, ignoring request");
            return false;
        }

        self.set_state(ConnectionState::Reconnecting);
        let manager = Arc::clone(self);
        let token = self.current_reconnect_token();
        tokio::spawn(async move {
            manager.reconnect_loop(token).await;
            manager.reconnect_in_flight.store(false, Ordering::Release);
        });
        true
    }

    async fn reconnect_loop(&self, token: CancellationToken) {
        let max_attempts = self.config.max_reconnect_attempts;
        let endpoint = self
            .active_endpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for attempt in 0..max_attempts {
            let delay = backoff_delay(self.config.reconnect_base_delay(), attempt);
            info!(
                "Reconnecting to {} in {:?} (attempt {}/{})",
                endpoint,
                delay,
                attempt + 1,
                max_attempts
            );

            tokio::select! {
                _ = token.cancelled() => {
                    info!("Reconnect cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            self.reconnect_attempts.fetch_add(1, Ordering::AcqRel);
            let result = tokio::select! {
                _ = token.cancelled() => {
                    info!("Reconnect cancelled");
                    return;
                }
                result = self.handshake_with(&endpoint) => result,
            };

            match result {
                Ok(()) => {
                    self.mark_connected(&endpoint);
                    return;
                }
                Err(failure) if failure.is_fatal() => {
                    error!(
                        "Reconnection rejected by broker ({}); giving up, check configuration",
                        failure
                    );
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
                Err(failure) => {
                    error!(
                        "Reconnection failed: {} (attempt {}/{})",
                        failure,
                        attempt + 1,
                        max_attempts
                    );
                }
            }
        }

        error!(
            "Maximum reconnection attempts reached ({}), MQTT stays disconnected",
            max_attempts
        );
        self.set_state(ConnectionState::Disconnected);
    }

    async fn handshake_with(&self, endpoint: &BrokerEndpoint) -> Result<(), ConnectFailure> {
        let handshake = self.open_session(endpoint).await?;
        flatten_handshake(handshake.await)
    }

    /// Publishes a message; `false` if not connected or the client refused it.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> bool {
        if !self.is_connected() {
            warn!("Cannot publish to {}: MQTT client is not connected", topic);
            return false;
        }

        let message = OutboundMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        };
        match self.transport.publish(message).await {
            Ok(()) => {
                debug!("Published to {}", topic);
                true
            }
            Err(e) => {
                error!("Failed to publish to {}: {}", topic, e);
                false
            }
        }
    }

    /// Stops reconnection and closes the session. Errors are logged, not returned.
    pub async fn disconnect(&self) {
        self.wanted.store(false, Ordering::Release);
        {
            let mut token = self
                .reconnect_token
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            token.cancel();
            *token = CancellationToken::new();
        }

        if let Err(e) = self.transport.close().await {
            error!("Error disconnecting MQTT: {}", e);
        }
        self.set_state(ConnectionState::Disconnected);
        info!("MQTT client stopped");
    }

    /// Disconnects and stops the event loop for good
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.lifetime.cancel();
    }

    async fn handle_event(self: &Arc<Self>, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected => {
                if !self.wanted.load(Ordering::Acquire) {
                    debug!("Ignoring late connection after disconnect");
                    return;
                }
                self.set_state(ConnectionState::Connected);
                self.on_connected().await;
            }
            BrokerEvent::Message(message) => {
                debug!("MQTT message received: {}", message);
                if self.inbound_tx.send(message).await.is_err() {
                    debug!("Inbound receiver closed, dropping message");
                }
            }
            BrokerEvent::Disconnected { graceful, reason } => {
                if graceful || !self.wanted.load(Ordering::Acquire) {
                    info!("MQTT broker connection closed normally ({})", reason);
                    self.set_state(ConnectionState::Disconnected);
                } else {
                    warn!("MQTT broker connection unexpectedly lost: {}", reason);
                    // Goes straight to Reconnecting; a loop already in flight
                    // owns the state from here.
                    if !self.schedule_reconnect() {
                        self.set_state(ConnectionState::Disconnected);
                    }
                }
            }
        }
    }

    // Subscriptions and the retained online announcement for a fresh session.
    async fn on_connected(&self) {
        let qos = self.config.qos();
        for topic in [self.topics.status(), self.topics.wildcard()] {
            match self.transport.subscribe(topic, qos).await {
                Ok(()) => info!("Subscribed to topic: {} (QoS: {:?})", topic, qos),
                Err(e) => error!("Failed to subscribe to {}: {}", topic, e),
            }
        }

        let announcement = serde_json::json!({
            "status": "online",
            "client_id": self.client_id,
            "timestamp": chrono::Utc::now().timestamp(),
        });
        if !self
            .publish(
                self.topics.status(),
                announcement.to_string().into_bytes(),
                qos,
                true,
            )
            .await
        {
            warn!("Could not publish online announcement");
        }
    }
}

fn flatten_handshake(
    result: Result<Result<(), ConnectFailure>, tokio::sync::oneshot::error::RecvError>,
) -> Result<(), ConnectFailure> {
    result.unwrap_or(Err(ConnectFailure::Aborted))
}

fn generate_client_id(prefix: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &suffix[..8])
}

async fn run_event_loop(
    manager: Weak<ConnectionManager>,
    mut events: mpsc::Receiver<BrokerEvent>,
    lifetime: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = lifetime.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.handle_event(event).await;
    }
    debug!("Connection event loop stopped");
}
