//! # loki-bridge
//!
//! Bridges an HTTP control/status API for the Loki media player to an MQTT
//! broker. Status snapshots flow in from HTTP clients and from the broker,
//! control commands flow out to the player over the broker.
//!
//! ```text
//! src/
//! ├── bridge.rs   - Facade owning every component and background task
//! ├── config.rs   - bridge.toml loading, environment overrides, validation
//! ├── error.rs    - ValidationError and BridgeError
//! ├── http/       - axum routes and handlers
//! ├── mqtt/       - connection manager, router, command dispatcher
//! └── status/     - snapshot model and bounded history store
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod http;
pub mod mqtt;
pub mod status;

pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use error::{BridgeError, ValidationError};
