// sb-protocol: wire frame types and payload schemas for the sensor backbone.
//
// All WebSocket traffic is framed JSON with a fixed envelope:
//
// ```json
// { "topic": "sensor:S1", "event": "measurement", "payload": { ... }, "ref": "3" }
// ```
//
// `topic` routes the frame, `event` selects the payload schema, and `ref` is
// an optional correlation id: frames carrying a `ref` receive exactly one
// `reply` frame echoing it; frames without `ref` are fire-and-forget.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Frame envelope
// ---------------------------------------------------------------------------

/// The envelope every wire message travels in, both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Correlation id. Present iff the sender expects a `reply` frame.
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub frame_ref: Option<String>,
}

impl Frame {
    /// Build a fire-and-forget frame (no `ref`, no reply expected).
    pub fn push(topic: impl Into<String>, event: &str, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            event: event.to_owned(),
            payload,
            frame_ref: None,
        }
    }

    /// Build a frame that expects a `reply` carrying the same `ref`.
    pub fn request(
        topic: impl Into<String>,
        event: &str,
        payload: serde_json::Value,
        frame_ref: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            event: event.to_owned(),
            payload,
            frame_ref: Some(frame_ref.into()),
        }
    }

    /// Build the `reply` frame answering `request`, echoing topic and `ref`.
    pub fn reply_to(request: &Frame, payload: ReplyPayload) -> Self {
        Self {
            topic: request.topic.clone(),
            event: events::REPLY.to_owned(),
            payload: serde_json::to_value(payload).unwrap_or_default(),
            frame_ref: request.frame_ref.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// A parsed topic string.
///
/// `connector:` and `sensor:` are client-declared; `data:`, `signal:`,
/// `attention:` and `system:load` exist on the internal bus and on
/// server-to-observer frames only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Connector(String),
    Sensor(String),
    Data(String),
    Signal(String),
    Attention(String),
    SystemLoad,
}

impl Topic {
    /// Parse a `kind:id` topic string. Returns `None` for unknown kinds or
    /// empty ids.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw == "system:load" {
            return Some(Topic::SystemLoad);
        }
        let (kind, id) = raw.split_once(':')?;
        if id.is_empty() {
            return None;
        }
        match kind {
            "connector" => Some(Topic::Connector(id.to_owned())),
            "sensor" => Some(Topic::Sensor(id.to_owned())),
            "data" => Some(Topic::Data(id.to_owned())),
            "signal" => Some(Topic::Signal(id.to_owned())),
            "attention" => Some(Topic::Attention(id.to_owned())),
            _ => None,
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topic::Connector(id) => write!(f, "connector:{id}"),
            Topic::Sensor(id) => write!(f, "sensor:{id}"),
            Topic::Data(id) => write!(f, "data:{id}"),
            Topic::Signal(id) => write!(f, "signal:{id}"),
            Topic::Attention(id) => write!(f, "attention:{id}"),
            Topic::SystemLoad => write!(f, "system:load"),
        }
    }
}

// ---------------------------------------------------------------------------
// Event names
// ---------------------------------------------------------------------------

/// Frozen event names. The payload schema for each is defined below.
pub mod events {
    // Client -> server
    pub const JOIN: &str = "join";
    pub const MEASUREMENT: &str = "measurement";
    pub const MEASUREMENTS_BATCH: &str = "measurements_batch";
    pub const UPDATE_ATTRIBUTES: &str = "update_attributes";
    pub const PING: &str = "ping";

    // Observer -> server
    pub const WATCH: &str = "watch";
    pub const UNWATCH: &str = "unwatch";
    pub const REGISTER_VIEW: &str = "register_view";
    pub const UNREGISTER_VIEW: &str = "unregister_view";
    pub const REGISTER_HOVER: &str = "register_hover";
    pub const UNREGISTER_HOVER: &str = "unregister_hover";
    pub const REGISTER_FOCUS: &str = "register_focus";
    pub const UNREGISTER_FOCUS: &str = "unregister_focus";
    pub const PIN_SENSOR: &str = "pin_sensor";
    pub const UNPIN_SENSOR: &str = "unpin_sensor";
    pub const REPORT_BATTERY: &str = "report_battery";
    pub const HEARTBEAT: &str = "heartbeat";

    // Server -> client
    pub const REPLY: &str = "reply";
    pub const BACKPRESSURE_CONFIG: &str = "backpressure_config";
    pub const SENSOR_STATE: &str = "sensor_state";
}

// ---------------------------------------------------------------------------
// Shared enums
// ---------------------------------------------------------------------------

/// Coarse demand signal computed from observer UI state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum AttentionLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
}

impl AttentionLevel {
    /// Step the level down by `steps`, saturating at `None`.
    pub fn downgrade(self, steps: u8) -> Self {
        let mut level = self;
        for _ in 0..steps {
            level = match level {
                AttentionLevel::High => AttentionLevel::Medium,
                AttentionLevel::Medium => AttentionLevel::Low,
                AttentionLevel::Low | AttentionLevel::None => AttentionLevel::None,
            };
        }
        level
    }
}

/// Coarse resource-pressure signal computed from runtime metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SystemLoadLevel {
    #[default]
    Normal,
    Elevated,
    High,
    Critical,
}

/// Observer-reported battery condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BatteryState {
    #[default]
    Normal,
    Low,
    Critical,
}

// ---------------------------------------------------------------------------
// Connector -> server payloads
// ---------------------------------------------------------------------------

/// Join payload on `sensor:<id>` (full) or `connector:<id>` (control-only).
///
/// The bearer token is verified before any other processing; a failed
/// verification closes the session with `unauthorized`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinPayload {
    pub connector_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_type: Option<String>,
    /// Attribute ids the connector intends to publish. Validated against the
    /// deployment vocabulary at join time.
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    pub bearer_token: String,
}

/// A single measurement as it crosses the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementPayload {
    pub attribute_id: String,
    pub payload: serde_json::Value,
    /// Unix milliseconds, device-reported.
    pub timestamp: i64,
    /// Discrete edge marker for event-style attributes (e.g. "press").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

/// Payload of `update_attributes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateAttributesPayload {
    /// One of `add`, `remove`, `update`.
    pub action: String,
    pub attribute_id: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Observer -> server payloads
// ---------------------------------------------------------------------------

/// Join payload for observer sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObserverJoinPayload {
    pub observer_id: String,
    pub bearer_token: String,
}

/// Payload of `watch` / `unwatch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchPayload {
    pub sensor_id: String,
}

/// Payload of the view/hover/focus register and unregister events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttentionSignalPayload {
    pub sensor_id: String,
    pub attribute_id: String,
}

/// Payload of `pin_sensor` / `unpin_sensor`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinPayload {
    pub sensor_id: String,
}

/// Payload of `report_battery`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryPayload {
    pub state: BatteryState,
}

// ---------------------------------------------------------------------------
// Server -> client payloads
// ---------------------------------------------------------------------------

/// Per-connector batching directive, pushed at session start and on change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackpressureConfigPayload {
    pub attention_level: AttentionLevel,
    pub system_load: SystemLoadLevel,
    /// True when system load is critical and attention is low or none.
    pub paused: bool,
    pub recommended_batch_window_ms: u64,
    pub recommended_batch_size: u32,
    pub load_multiplier: f64,
    /// Server wall clock (unix ms) when the config was generated.
    pub timestamp: i64,
}

/// Status of a `reply` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
}

/// Payload of every `reply` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub status: ReplyStatus,
    #[serde(default)]
    pub response: serde_json::Value,
}

impl ReplyPayload {
    pub fn ok(response: serde_json::Value) -> Self {
        Self {
            status: ReplyStatus::Ok,
            response,
        }
    }

    pub fn error(body: ErrorBody) -> Self {
        Self {
            status: ReplyStatus::Error,
            response: serde_json::to_value(body).unwrap_or_default(),
        }
    }
}

/// Structured error carried in an error reply's `response`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// One of the frozen codes in [`error_codes`].
    pub code: String,
    pub message: String,
    /// Only set for `invalid_batch`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_count: Option<usize>,
}

impl ErrorBody {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_owned(),
            message: message.into(),
            failed_count: None,
        }
    }
}

/// Frozen error codes.
///
/// | Code                 | Closes session |
/// |----------------------|----------------|
/// | unauthorized         | yes            |
/// | actor_poisoned       | yes            |
/// | protocol_error       | yes            |
/// | invalid_attribute_id | no             |
/// | invalid_action       | no             |
/// | missing_fields       | no             |
/// | unknown_field        | no             |
/// | invalid_payload      | no             |
/// | invalid_batch        | no             |
/// | internal_error       | no             |
pub mod error_codes {
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const INVALID_ATTRIBUTE_ID: &str = "invalid_attribute_id";
    pub const INVALID_ACTION: &str = "invalid_action";
    pub const MISSING_FIELDS: &str = "missing_fields";
    pub const UNKNOWN_FIELD: &str = "unknown_field";
    pub const INVALID_PAYLOAD: &str = "invalid_payload";
    pub const INVALID_BATCH: &str = "invalid_batch";
    pub const ACTOR_POISONED: &str = "actor_poisoned";
    pub const PROTOCOL_ERROR: &str = "protocol_error";
    pub const INTERNAL_ERROR: &str = "internal_error";
}
