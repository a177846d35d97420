//! # tcpr-events
//!
//! Control-plane event definitions for the TCP routing tier.
//!
//! ## Design Principles
//!
//! - Events describe port mapping changes, never routing decisions
//! - Every event targets exactly one external port
//! - Decoding is strict: a known event type with a malformed payload is an error,
//!   an unknown event type is skipped by the consumer
//!
//! ## Event Types
//!
//! - Port events (`tcp_port.added`, `tcp_port.removed`)
//! - Backend events (`tcp_backend.attached`, `tcp_backend.detached`)

mod error;
mod mapping;
mod types;

pub use error::EventError;
pub use mapping::MappingEvent;
pub use types::*;
