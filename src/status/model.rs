use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// Synchronisation state reported by the media player
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Synced,
    Syncing,
    Error,
    #[default]
    Unknown,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Error => "error",
            SyncStatus::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

// Sensor state reported by the media player
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorStatus {
    Active,
    Inactive,
    Error,
    #[default]
    Unknown,
}

impl fmt::Display for SensorStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            SensorStatus::Active => "active",
            SensorStatus::Inactive => "inactive",
            SensorStatus::Error => "error",
            SensorStatus::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// One status report from the media player.
///
/// This is the only schema for status data; HTTP bodies and broker payloads
/// both go through [`StatusSnapshot::from_value`] so defaults and validation are
/// applied identically. Absent fields take their defaults, unknown fields are
/// ignored, and anything with the wrong type or an unrecognised enum value is
/// rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Unix timestamp in seconds, defaults to the time of parsing
    #[serde(default = "unix_now")]
    pub timestamp: i64,
    #[serde(default)]
    pub queue_length: u64,
    #[serde(default)]
    pub fps: f64,
    #[serde(default)]
    pub saved_files: Vec<String>,
    #[serde(default)]
    pub sync_status: SyncStatus,
    #[serde(default)]
    pub sensor_status: SensorStatus,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            timestamp: unix_now(),
            queue_length: 0,
            fps: 0.0,
            saved_files: Vec::new(),
            sync_status: SyncStatus::Unknown,
            sensor_status: SensorStatus::Unknown,
        }
    }
}

impl StatusSnapshot {
    /// Parses a raw payload into a validated snapshot
    pub fn from_slice(payload: &[u8]) -> Result<Self, ValidationError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;
        Self::from_value(value)
    }

    /// Coerces an already-decoded JSON value into a validated snapshot
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        if !value.is_object() {
            return Err(ValidationError::Malformed(format!(
                "expected a JSON object, got {}",
                json_kind(&value)
            )));
        }
        let snapshot: StatusSnapshot = serde_json::from_value(value)?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Checks range constraints serde cannot express
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.fps.is_finite() || self.fps < 0.0 {
            return Err(ValidationError::OutOfRange {
                field: "fps",
                reason: format!("must be a non-negative number, got {}", self.fps),
            });
        }
        Ok(())
    }
}

pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
