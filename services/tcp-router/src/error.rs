//! Error types for the routing engine.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::proxy::{Direction, Endpoint};

/// Routing errors with standardized reason codes.
///
/// Everything except `ListenerBind` and `RouterStopped` is scoped to a single
/// client connection and never escapes its dispatch task.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The port has no backends (or is unknown).
    #[error("no backends available for port {port}")]
    NoBackendsAvailable { port: u16 },

    /// Backend did not complete the TCP handshake in time.
    #[error("dial to {endpoint} timed out after {timeout:?}")]
    DialTimeout { endpoint: Endpoint, timeout: Duration },

    /// Backend refused or reset the connection.
    #[error("dial to {endpoint} failed: {source}")]
    DialRefused {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    /// Every dial attempt for a client connection failed.
    #[error("all {attempts} dial attempts failed for port {port}")]
    AllDialsFailed { port: u16, attempts: usize },

    /// One relay direction failed.
    #[error("relay {direction} failed: {source}")]
    RelayIo {
        direction: Direction,
        #[source]
        source: io::Error,
    },

    /// No bytes flowed in either direction for the idle interval.
    #[error("session idle for {idle:?}")]
    IdleTimeout { idle: Duration },

    /// Could not bind the listening socket for an external port.
    #[error("failed to bind listener for port {port}: {source}")]
    ListenerBind {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// The router task is gone.
    #[error("router stopped")]
    RouterStopped,
}

impl RouterError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RouterError::NoBackendsAvailable { .. } => "no_backends_available",
            RouterError::DialTimeout { .. } => "dial_timeout",
            RouterError::DialRefused { .. } => "dial_refused",
            RouterError::AllDialsFailed { .. } => "all_dials_failed",
            RouterError::RelayIo { .. } => "relay_io_error",
            RouterError::IdleTimeout { .. } => "idle_timeout",
            RouterError::ListenerBind { .. } => "listener_bind_failure",
            RouterError::RouterStopped => "router_stopped",
        }
    }

    /// Dial failures are soft: the dispatcher moves on to the next backend.
    pub fn is_dial_failure(&self) -> bool {
        matches!(
            self,
            RouterError::DialTimeout { .. } | RouterError::DialRefused { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        let endpoint = Endpoint::new("10.0.0.5", 3333);
        let err = RouterError::DialTimeout {
            endpoint: endpoint.clone(),
            timeout: Duration::from_secs(2),
        };
        assert_eq!(err.reason_code(), "dial_timeout");
        assert!(err.is_dial_failure());

        let err = RouterError::DialRefused {
            endpoint,
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert!(err.is_dial_failure());

        let err = RouterError::NoBackendsAvailable { port: 61001 };
        assert_eq!(err.reason_code(), "no_backends_available");
        assert!(!err.is_dial_failure());
        assert_eq!(err.to_string(), "no backends available for port 61001");
    }
}
