//! Error types shared across the bridge

use thiserror::Error;

/// A field-level validation failure on a snapshot or command.
///
/// Raised at the boundary (HTTP body or inbound broker payload) so invalid data
/// never reaches the status store or the broker.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// Payload is not valid JSON or not a JSON object
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// A field has the wrong type or an unrecognised enum value
    #[error("Invalid field: {0}")]
    InvalidField(String),

    /// A numeric field is out of its permitted range
    #[error("Field '{field}' out of range: {reason}")]
    OutOfRange { field: &'static str, reason: String },
}

impl From<serde_json::Error> for ValidationError {
    fn from(err: serde_json::Error) -> Self {
        match err.classify() {
            serde_json::error::Category::Data => ValidationError::InvalidField(err.to_string()),
            _ => ValidationError::Malformed(err.to_string()),
        }
    }
}

/// Errors surfaced by the bridge facade to the HTTP layer
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The bridge has been closed and no longer accepts work
    #[error("Bridge is shut down")]
    Closed,
}
