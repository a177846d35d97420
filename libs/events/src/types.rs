//! Event type definitions for port mapping events.
//!
//! Each event type has a corresponding payload struct. Payloads are flat JSON
//! objects keyed by the external port they mutate.

use serde::{Deserialize, Serialize};

// =============================================================================
// Event Type Constants
// =============================================================================

/// All mapping event type names as constants.
pub mod event_types {
    // Port
    pub const TCP_PORT_ADDED: &str = "tcp_port.added";
    pub const TCP_PORT_REMOVED: &str = "tcp_port.removed";

    // Backend
    pub const TCP_BACKEND_ATTACHED: &str = "tcp_backend.attached";
    pub const TCP_BACKEND_DETACHED: &str = "tcp_backend.detached";

    /// Every event type the routing tier consumes.
    pub const ALL: [&str; 4] = [
        TCP_PORT_ADDED,
        TCP_PORT_REMOVED,
        TCP_BACKEND_ATTACHED,
        TCP_BACKEND_DETACHED,
    ];
}

// =============================================================================
// Event Payloads
// =============================================================================

// -----------------------------------------------------------------------------
// Port Events
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAddedPayload {
    pub external_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRemovedPayload {
    pub external_port: u16,
}

// -----------------------------------------------------------------------------
// Backend Events
// -----------------------------------------------------------------------------

/// A backend registered behind an external port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendAttachedPayload {
    pub external_port: u16,
    /// Private host of the application instance.
    pub host: String,
    /// Container port the instance listens on.
    pub port: u16,
    /// Optional instance identifier; not used for routing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendDetachedPayload {
    pub external_port: u16,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

// =============================================================================
// Tests
// =============================================================================
