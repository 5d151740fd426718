//! Status data model and the bounded in-memory store
//!
//! [`model`] holds the single validated schema for status snapshots, [`store`]
//! keeps the latest snapshot plus a FIFO history shared between the HTTP
//! handlers and the broker event loop.

pub mod model;
pub mod store;

pub use model::{SensorStatus, StatusSnapshot, SyncStatus};
pub use store::{StatusStore, DEFAULT_HISTORY_CAPACITY, MAX_HISTORY_LIMIT};
