//! tcpr-router: L4 TCP routing data plane.
//!
//! Maps external TCP ports to sets of backend endpoints and relays client
//! connections to them. See [`proxy`] for the engine.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod proxy;
pub mod sync;

pub use error::RouterError;
pub use proxy::{
    BackendSelector, ConnectionDispatcher, ControlCommand, DispatchConfig, Endpoint, Mapping,
    PortStats, ProxySession, Router, RouterConfig, RouterHandle, RoutingTable, SessionConfig,
    SessionTracker, ShutdownReport,
};
