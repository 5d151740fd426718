//! # MQTT Integration Module
//!
//! Everything that talks to the broker: one logical connection with automatic
//! recovery, routing of inbound messages into the status store, and outbound
//! control commands with response correlation.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker endpoints, QoS, retain and retry settings
//! ├── topics.rs           - Topic layout derived from the prefix
//! ├── message_manager.rs  - Inbound/outbound message and broker event types
//! ├── transport.rs        - BrokerTransport seam and the rumqttc implementation
//! ├── mqtt_handler.rs     - ConnectionManager state machine and reconnect loop
//! ├── dispatcher.rs       - ControlCommand publishing and pending correlation
//! ├── router.rs           - Topic based routing of inbound messages
//! └── router_worker.rs    - statum lifecycle of the router task
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! rumqttc EventLoop ─► pump task ─► BrokerEvent ─► ConnectionManager event loop
//!                                                        │ InboundMessage
//!                                                        ▼
//!                      StatusStore ◄── MessageRouter ◄── RouterWorker
//!                                          │
//!                                          └─► CommandDispatcher::resolve
//! ```

pub mod config;
pub mod dispatcher;
pub mod message_manager;
pub mod mqtt_handler;
pub mod router;
pub mod router_worker;
pub mod topics;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{BrokerEndpoint, MqttConfig};
pub use dispatcher::{Action, CommandDispatcher, ControlCommand, PendingCommand};
pub use message_manager::{BrokerEvent, InboundMessage, OutboundMessage, WillMessage};
pub use mqtt_handler::{ConnectOutcome, ConnectionManager, ConnectionState};
pub use router::{MessageRouter, PendingEchoes, RouteOutcome};
pub use router_worker::RouterHandle;
pub use topics::TopicLayout;
pub use transport::{BrokerTransport, ConnectFailure, RejectReason, RumqttcTransport, TransportError};
