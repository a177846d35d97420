//! Error types for event handling.

use thiserror::Error;

/// Errors that can occur when decoding mapping events.
#[derive(Debug, Error, Clone)]
pub enum EventError {
    /// The event type is not a mapping event.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// The event payload is invalid.
    #[error("invalid {event_type} payload: {reason}")]
    InvalidPayload { event_type: String, reason: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
