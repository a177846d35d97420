//! L4 TCP routing engine.
//!
//! This module provides:
//! - The port-to-backends routing table
//! - Round-robin backend selection, one cursor per port
//! - A connection dispatcher (accept loop) per external port
//! - Bidirectional relay sessions with half-close and idle timeout
//! - The router that opens and closes dispatchers as ports come and go
//!
//! ## Architecture
//!
//! ```text
//! control commands -> Router -> RoutingTable
//!                       |
//!                       +-> ConnectionDispatcher (one per port)
//!                                 |
//! Client ----------------------> accept -> BackendSelector -> dial -> ProxySession -> Backend
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{ControlCommand, Endpoint, Router, RouterConfig};
//!
//! let router = Router::new(RouterConfig::default()).spawn();
//! router.apply(ControlCommand::AttachBackend {
//!     port: 61001,
//!     endpoint: Endpoint::new("10.0.0.5", 8080),
//! }).await?;
//! let report = router.shutdown().await?;
//! ```

mod backend;
mod dispatcher;
mod router;
mod session;
mod table;

pub use backend::{dial, BackendSelector, Endpoint, DEFAULT_CONNECT_TIMEOUT};
pub use dispatcher::{
    ConnectionDispatcher, DispatchConfig, DispatcherStats, PortStats, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_MAX_DIAL_ATTEMPTS,
};
pub use router::{
    BackoffPolicy, ControlCommand, Router, RouterConfig, RouterHandle, ShutdownReport,
    DEFAULT_DRAIN_GRACE,
};
pub use session::{
    Direction, ProxySession, SessionConfig, SessionEnd, SessionState, SessionSummary,
    SessionTicket, SessionTracker, DEFAULT_BUFFER_SIZE, DEFAULT_IDLE_TIMEOUT,
};
pub use table::{Mapping, RoutingTable};
