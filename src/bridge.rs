//! Bridge facade
//!
//! [`Bridge`] wires the status store, connection manager, command dispatcher and
//! router together and is the only thing the HTTP layer talks to. It is built
//! once in `main`, shared as `Arc<Bridge>` and torn down with [`Bridge::close`].
//!
//! ```text
//!  HTTP handlers ──► Bridge ──► StatusStore
//!                      │  └───► CommandDispatcher ──► ConnectionManager ──► broker
//!                      └──────► RouterHandle ◄── inbound channel ◄─────────┘
//! ```

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::mqtt::{
    BrokerTransport, CommandDispatcher, ConnectOutcome, ConnectionManager, ConnectionState,
    ControlCommand, MessageRouter, PendingEchoes, RouterHandle, RumqttcTransport,
};
use crate::status::model::unix_now;
use crate::status::{SensorStatus, StatusSnapshot, StatusStore, SyncStatus};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Answer to an accepted control command. Publishing happens afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandReceipt {
    pub accepted: bool,
    pub command_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Health {
    pub connected: bool,
    pub state: ConnectionState,
    pub uptime_seconds: f64,
    pub has_data: bool,
    pub last_status_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentMetrics {
    pub fps: f64,
    pub queue_length: u64,
    pub sync_status: SyncStatus,
    pub sensor_status: SensorStatus,
    pub file_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemInfo {
    pub last_updated: i64,
    pub server_uptime: f64,
    pub mqtt_connected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metrics {
    pub current_metrics: CurrentMetrics,
    pub system_info: SystemInfo,
}

pub struct Bridge {
    config: BridgeConfig,
    store: Arc<StatusStore>,
    connection: Arc<ConnectionManager>,
    dispatcher: Arc<CommandDispatcher>,
    echoes: Arc<PendingEchoes>,
    router: tokio::sync::Mutex<RouterHandle>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Bridge {
    /// Builds the bridge and spawns its background tasks. Does not connect;
    /// call [`Bridge::start`] for that.
    pub fn new(config: BridgeConfig, transport: Arc<dyn BrokerTransport>) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.mqtt.channel_capacity.max(1));
        let store = Arc::new(StatusStore::new(config.history_capacity));
        let connection = ConnectionManager::spawn(config.mqtt.clone(), transport, inbound_tx);
        let dispatcher = Arc::new(CommandDispatcher::new(connection.clone(), &config.mqtt));

        let shutdown = CancellationToken::new();
        let router = MessageRouter::new(
            connection.topics().clone(),
            store.clone(),
            dispatcher.clone(),
        );
        let echoes = router.echoes();
        let router = RouterHandle::spawn(router, inbound_rx, shutdown.child_token());
        let sweeper = spawn_sweeper(
            dispatcher.clone(),
            Duration::from_secs(config.sweep_interval_secs.max(1)),
            shutdown.child_token(),
        );

        Arc::new(Self {
            config,
            store,
            connection,
            dispatcher,
            echoes,
            router: tokio::sync::Mutex::new(router),
            sweeper: Mutex::new(Some(sweeper)),
            shutdown,
            closed: AtomicBool::new(false),
        })
    }

    /// Bridge backed by a real rumqttc client
    pub fn with_rumqttc(config: BridgeConfig) -> Arc<Self> {
        Self::new(config, Arc::new(RumqttcTransport::new()))
    }

    pub async fn start(&self) -> ConnectOutcome {
        let outcome = self.connection.connect().await;
        match &outcome {
            ConnectOutcome::Connected => info!("Bridge started, MQTT connected"),
            ConnectOutcome::Pending => {
                warn!("Bridge started, MQTT connection still in progress")
            }
            ConnectOutcome::Failed(e) => {
                warn!("Bridge started without MQTT connection: {}", e)
            }
        }
        outcome
    }

    fn ensure_open(&self) -> Result<(), BridgeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BridgeError::Closed);
        }
        Ok(())
    }

    /// Validates and stores a snapshot, then republishes it on the status topic
    /// when the broker is connected
    pub async fn submit_status(&self, value: Value) -> Result<StatusSnapshot, BridgeError> {
        self.ensure_open()?;
        let snapshot = StatusSnapshot::from_value(value)?;
        self.store.update(snapshot.clone());

        if self.connection.is_connected() {
            match serde_json::to_vec(&snapshot) {
                Ok(payload) => {
                    // The broker routes our publish back to us; the router
                    // drops it once against this entry.
                    self.echoes.expect(&payload);
                    let published = self
                        .connection
                        .publish(
                            self.connection.topics().status(),
                            payload.clone(),
                            self.config.mqtt.qos(),
                            self.config.mqtt.retain_status,
                        )
                        .await;
                    if !published {
                        self.echoes.take(&payload);
                        warn!("Status stored but not broadcast");
                    }
                }
                Err(e) => error!("Failed to encode status snapshot: {}", e),
            }
        }
        Ok(snapshot)
    }

    pub fn latest_status(&self) -> Option<StatusSnapshot> {
        self.store.latest()
    }

    pub fn history(&self, limit: usize) -> Vec<StatusSnapshot> {
        self.store.history(limit)
    }

    /// Saved files of the latest snapshot, `None` before any status arrived
    pub fn saved_files(&self) -> Option<(Vec<String>, i64)> {
        self.store
            .latest()
            .map(|snapshot| (snapshot.saved_files, snapshot.timestamp))
    }

    pub fn metrics(&self) -> Option<Metrics> {
        let latest = self.store.latest()?;
        Some(Metrics {
            current_metrics: CurrentMetrics {
                fps: latest.fps,
                queue_length: latest.queue_length,
                sync_status: latest.sync_status,
                sensor_status: latest.sensor_status,
                file_count: latest.saved_files.len(),
            },
            system_info: SystemInfo {
                last_updated: latest.timestamp,
                server_uptime: self.store.uptime().as_secs_f64(),
                mqtt_connected: self.connection.is_connected(),
            },
        })
    }

    /// Validates a command, assigns its id and hands publishing to a background
    /// task. Returns before the broker sees the command.
    pub fn send_command(&self, value: Value) -> Result<CommandReceipt, BridgeError> {
        self.ensure_open()?;
        let mut command = ControlCommand::from_value(value)?;
        let command_id = command.ensure_id().to_string();
        let parameters = Value::Object(command.parameters.clone());
        info!(
            "Control command received: {} (parameters: {})",
            command.action, parameters
        );

        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            if !dispatcher.send(command).await {
                debug!("Background command publish did not go through");
            }
        });

        Ok(CommandReceipt {
            accepted: true,
            command_id,
        })
    }

    pub fn health(&self) -> Health {
        let state = self.connection.state();
        Health {
            connected: state == ConnectionState::Connected,
            state,
            uptime_seconds: self.store.uptime().as_secs_f64(),
            has_data: self.store.latest().is_some(),
            last_status_time: self.store.last_updated(),
        }
    }

    pub fn pending_commands(&self) -> usize {
        self.dispatcher.pending_count()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops every background task and disconnects. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down bridge");
        self.shutdown.cancel();
        self.connection.shutdown().await;

        if let Some(routed) = self.router.lock().await.shutdown().await {
            debug!("Router handled {} messages", routed);
        }

        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            if let Err(e) = sweeper.await {
                error!("Command sweeper failed: {}", e);
            }
        }
        info!("Bridge stopped");
    }
}

fn spawn_sweeper(
    dispatcher: Arc<CommandDispatcher>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let expired = dispatcher.expire_stale();
                    if expired > 0 {
                        debug!("Expired {} pending commands at {}", expired, unix_now());
                    }
                }
            }
        }
        debug!("Command sweeper stopped");
    })
}
