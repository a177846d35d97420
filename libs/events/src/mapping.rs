//! Typed decoding of raw `(event_type, payload)` pairs.

use serde::de::DeserializeOwned;

use crate::error::EventError;
use crate::types::{
    event_types, BackendAttachedPayload, BackendDetachedPayload, PortAddedPayload,
    PortRemovedPayload,
};

/// A decoded port mapping event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingEvent {
    PortAdded(PortAddedPayload),
    PortRemoved(PortRemovedPayload),
    BackendAttached(BackendAttachedPayload),
    BackendDetached(BackendDetachedPayload),
}

impl MappingEvent {
    /// Returns true if `event_type` names a mapping event.
    pub fn is_mapping_event(event_type: &str) -> bool {
        event_types::ALL.contains(&event_type)
    }

    /// Decode a raw event.
    ///
    /// Unknown event types yield `EventError::UnknownEventType`; callers that
    /// tail a mixed event stream should filter with [`Self::is_mapping_event`]
    /// first.
    pub fn decode(event_type: &str, payload: serde_json::Value) -> Result<Self, EventError> {
        let event = match event_type {
            event_types::TCP_PORT_ADDED => Self::PortAdded(parse(event_type, payload)?),
            event_types::TCP_PORT_REMOVED => Self::PortRemoved(parse(event_type, payload)?),
            event_types::TCP_BACKEND_ATTACHED => {
                Self::BackendAttached(parse(event_type, payload)?)
            }
            event_types::TCP_BACKEND_DETACHED => {
                Self::BackendDetached(parse(event_type, payload)?)
            }
            other => return Err(EventError::UnknownEventType(other.to_string())),
        };

        event.validate()?;
        Ok(event)
    }

    /// The wire name of this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PortAdded(_) => event_types::TCP_PORT_ADDED,
            Self::PortRemoved(_) => event_types::TCP_PORT_REMOVED,
            Self::BackendAttached(_) => event_types::TCP_BACKEND_ATTACHED,
            Self::BackendDetached(_) => event_types::TCP_BACKEND_DETACHED,
        }
    }

    /// The external port this event mutates.
    pub fn external_port(&self) -> u16 {
        match self {
            Self::PortAdded(p) => p.external_port,
            Self::PortRemoved(p) => p.external_port,
            Self::BackendAttached(p) => p.external_port,
            Self::BackendDetached(p) => p.external_port,
        }
    }

    /// Encode the payload back to JSON.
    pub fn payload(&self) -> Result<serde_json::Value, EventError> {
        let value = match self {
            Self::PortAdded(p) => serde_json::to_value(p)?,
            Self::PortRemoved(p) => serde_json::to_value(p)?,
            Self::BackendAttached(p) => serde_json::to_value(p)?,
            Self::BackendDetached(p) => serde_json::to_value(p)?,
        };
        Ok(value)
    }

    fn validate(&self) -> Result<(), EventError> {
        let invalid = |reason: &str| EventError::InvalidPayload {
            event_type: self.event_type().to_string(),
            reason: reason.to_string(),
        };

        if self.external_port() == 0 {
            return Err(invalid("external_port must be non-zero"));
        }

        let (host, port) = match self {
            Self::BackendAttached(p) => (p.host.as_str(), p.port),
            Self::BackendDetached(p) => (p.host.as_str(), p.port),
            _ => return Ok(()),
        };

        if host.trim().is_empty() {
            return Err(invalid("host must not be empty"));
        }
        if port == 0 {
            return Err(invalid("backend port must be non-zero"));
        }

        Ok(())
    }
}

fn parse<T: DeserializeOwned>(event_type: &str, payload: serde_json::Value) -> Result<T, EventError> {
    serde_json::from_value(payload).map_err(|e| EventError::InvalidPayload {
        event_type: event_type.to_string(),
        reason: e.to_string(),
    })
}
