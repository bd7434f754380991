//! Engine error kinds and their wire-code mapping.

use sb_protocol::error_codes;
use thiserror::Error;

/// Errors surfaced by the engine.
///
/// Validation errors are returned synchronously to the calling session and
/// never kill a session or an actor. Overflow is never surfaced to
/// publishers (counters only); the variant exists for observability paths
/// that do report it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("attribute id '{0}' is not in the configured vocabulary")]
    InvalidAttributeId(String),

    #[error("action '{0}' is not one of add, remove, update")]
    InvalidAction(String),

    #[error("missing required fields: {fields}")]
    MissingFields { fields: String },

    #[error("unknown field '{0}' rejected")]
    UnknownField(String),

    #[error("payload for '{attribute_id}' must be numeric or a structured record")]
    InvalidPayload { attribute_id: String },

    #[error("all {failed_count} entries in the batch failed validation")]
    InvalidBatch { failed_count: usize },

    #[error("mailbox overflow on '{topic}' ({count} dropped)")]
    Overflow { topic: String, count: u64 },

    #[error("sensor '{0}' is poisoned after repeated crashes")]
    ActorPoisoned(String),

    #[error("message bus unavailable")]
    BusUnavailable,

    #[error("operation deadline exceeded")]
    Timeout,
}

impl CoreError {
    /// The frozen wire error code for this kind.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Unauthorized(_) => error_codes::UNAUTHORIZED,
            CoreError::InvalidAttributeId(_) => error_codes::INVALID_ATTRIBUTE_ID,
            CoreError::InvalidAction(_) => error_codes::INVALID_ACTION,
            CoreError::MissingFields { .. } => error_codes::MISSING_FIELDS,
            CoreError::UnknownField(_) => error_codes::UNKNOWN_FIELD,
            CoreError::InvalidPayload { .. } => error_codes::INVALID_PAYLOAD,
            CoreError::InvalidBatch { .. } => error_codes::INVALID_BATCH,
            CoreError::ActorPoisoned(_) => error_codes::ACTOR_POISONED,
            CoreError::Overflow { .. } | CoreError::BusUnavailable | CoreError::Timeout => {
                error_codes::INTERNAL_ERROR
            }
        }
    }

    /// Only set for `InvalidBatch`; carried in the error reply body.
    pub fn failed_count(&self) -> Option<usize> {
        match self {
            CoreError::InvalidBatch { failed_count } => Some(*failed_count),
            _ => None,
        }
    }
}
