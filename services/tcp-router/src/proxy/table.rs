//! Routing table: external port to backend endpoints.
//!
//! - Keys (external ports) are unique
//! - A port with zero backends stays registered but is unroutable
//! - Updates are applied atomically; readers never observe a torn backend list
//! - Updates never disturb established connections

use std::collections::BTreeMap;

use arc_swap::ArcSwap;
use tracing::debug;

use super::backend::Endpoint;

/// Association between one external port and its eligible backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub external_port: u16,
    /// Insertion order; only used as the deterministic rotation order.
    pub backends: Vec<Endpoint>,
}

impl Mapping {
    fn new(external_port: u16) -> Self {
        Self {
            external_port,
            backends: Vec::new(),
        }
    }

    /// A mapping without backends is equivalent to no mapping for dispatch.
    pub fn is_routable(&self) -> bool {
        !self.backends.is_empty()
    }
}

/// Immutable snapshot of the table for lock-free reads.
#[derive(Debug, Default, Clone)]
struct TableSnapshot {
    by_port: BTreeMap<u16, Mapping>,
}

impl TableSnapshot {
    fn with_port(&self, port: u16) -> Self {
        let mut next = self.clone();
        next.by_port.entry(port).or_insert_with(|| Mapping::new(port));
        next
    }

    fn with_backend(&self, port: u16, endpoint: &Endpoint) -> Self {
        let mut next = self.clone();
        let mapping = next.by_port.entry(port).or_insert_with(|| Mapping::new(port));
        if !mapping.backends.contains(endpoint) {
            mapping.backends.push(endpoint.clone());
        }
        next
    }

    fn without_backend(&self, port: u16, endpoint: &Endpoint) -> Self {
        let mut next = self.clone();
        let mapping = next.by_port.entry(port).or_insert_with(|| Mapping::new(port));
        mapping.backends.retain(|b| b != endpoint);
        next
    }

    fn without_port(&self, port: u16) -> Self {
        let mut next = self.clone();
        next.by_port.remove(&port);
        next
    }
}

/// Routing table shared between the router (single writer) and dispatchers.
///
/// Uses ArcSwap so readers get consistent snapshots without blocking and
/// writers atomically swap in new snapshots.
pub struct RoutingTable {
    snapshot: ArcSwap<TableSnapshot>,
}

impl RoutingTable {
    /// Create a new empty routing table.
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(TableSnapshot::default()),
        }
    }

    /// Register a port without backends. Returns true if the port was new.
    pub fn add_port(&self, port: u16) -> bool {
        let existed = self.contains_port(port);
        self.snapshot.rcu(|current| current.with_port(port));
        !existed
    }

    /// Add `endpoint` to the mapping for `port`, creating the mapping if needed.
    ///
    /// Idempotent. Returns true if the endpoint was not already present.
    pub fn upsert_backend(&self, port: u16, endpoint: Endpoint) -> bool {
        let present = self.snapshot(port).contains(&endpoint);
        self.snapshot
            .rcu(|current| current.with_backend(port, &endpoint));
        debug!(port, backend = %endpoint, added = !present, "Backend upserted");
        !present
    }

    /// Remove `endpoint` from the mapping for `port`.
    ///
    /// The port stays registered even when its last backend goes away, so a
    /// late backend can attach without reopening the listener. Unknown ports
    /// are registered implicitly. Returns true if the endpoint was present.
    pub fn remove_backend(&self, port: u16, endpoint: &Endpoint) -> bool {
        let present = self.snapshot(port).contains(endpoint);
        self.snapshot
            .rcu(|current| current.without_backend(port, endpoint));
        debug!(port, backend = %endpoint, removed = present, "Backend removed");
        present
    }

    /// Delete the mapping for `port`. Returns true if it existed.
    pub fn remove_port(&self, port: u16) -> bool {
        let existed = self.contains_port(port);
        self.snapshot.rcu(|current| current.without_port(port));
        existed
    }

    /// Point-in-time backend list for `port` (empty if unknown).
    pub fn snapshot(&self, port: u16) -> Vec<Endpoint> {
        self.snapshot
            .load()
            .by_port
            .get(&port)
            .map(|m| m.backends.clone())
            .unwrap_or_default()
    }

    /// Full mapping for `port`.
    pub fn mapping(&self, port: u16) -> Option<Mapping> {
        self.snapshot.load().by_port.get(&port).cloned()
    }

    /// Returns true if `port` is registered (routable or not).
    pub fn contains_port(&self, port: u16) -> bool {
        self.snapshot.load().by_port.contains_key(&port)
    }

    /// All registered ports, ascending.
    pub fn ports(&self) -> Vec<u16> {
        self.snapshot.load().by_port.keys().copied().collect()
    }

    /// Number of registered ports.
    pub fn len(&self) -> usize {
        self.snapshot.load().by_port.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().by_port.is_empty()
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}
