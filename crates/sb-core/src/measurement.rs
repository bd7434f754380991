//! Core data model: measurements, sensor metadata, snapshots.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single validated measurement as the engine stores and fans it out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub attribute_id: String,
    pub payload: serde_json::Value,
    /// Unix milliseconds, device-reported. Monotonic per actor, not globally
    /// ordered.
    pub timestamp_ms: i64,
    /// Discrete edge marker for event-style attributes (e.g. "press").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

/// Connector-declared sensor metadata, carried in the join payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorMeta {
    pub sensor_name: Option<String>,
    pub sensor_type: Option<String>,
    pub sampling_rate: Option<u32>,
    pub batch_size: Option<u32>,
}

/// Registry metadata for one attribute of one sensor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeMeta {
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub added_at_ms: i64,
}

/// Read-only deep copy of a sensor's state, handed to new observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub sensor_id: String,
    pub sensor_name: Option<String>,
    pub sensor_type: Option<String>,
    pub attributes: BTreeMap<String, AttributeMeta>,
    /// Most recent measurement per attribute.
    pub last: BTreeMap<String, Measurement>,
    pub created_at_ms: i64,
    pub last_ingest_at_ms: Option<i64>,
}
