//! Backend endpoints and round-robin selection.
//!
//! - Round-robin among the backends currently mapped to a port
//! - One cursor per external port, discarded when the port is removed
//! - Connect timeout to backend: 2s default

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::debug;

use crate::error::RouterError;

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// A backend's dial target.
///
/// Immutable once constructed; compared by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Create a new endpoint. Brackets around IPv6 literals are stripped.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_string)
            .unwrap_or(host);
        Self { host, port }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Connect to a backend, bounded by `connect_timeout`.
pub async fn dial(endpoint: &Endpoint, connect_timeout: Duration) -> Result<TcpStream, RouterError> {
    debug!(backend = %endpoint, "Connecting to backend");

    match timeout(
        connect_timeout,
        TcpStream::connect((endpoint.host(), endpoint.port())),
    )
    .await
    {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(RouterError::DialRefused {
            endpoint: endpoint.clone(),
            source,
        }),
        Err(_) => Err(RouterError::DialTimeout {
            endpoint: endpoint.clone(),
            timeout: connect_timeout,
        }),
    }
}

/// Round-robin selector keeping one cursor per external port.
///
/// Each client claims one rotation start; its dial attempts then walk the
/// backend list from there. The start is taken modulo the length of whatever
/// backend list the caller holds, so a shrinking set never indexes out of
/// range and a growing set pulls new backends into rotation on the next cycle.
///
/// Cursors exist only between [`register`](Self::register) and
/// [`forget`](Self::forget); selection never creates one, so a client still
/// dispatching on a removed port cannot resurrect its rotation.
pub struct BackendSelector {
    /// Cursors keyed by external port.
    cursors: RwLock<HashMap<u16, Arc<AtomicUsize>>>,
}

impl BackendSelector {
    /// Create a new backend selector.
    pub fn new() -> Self {
        Self {
            cursors: RwLock::new(HashMap::new()),
        }
    }

    /// Start a rotation for `port`; an existing rotation is kept.
    pub async fn register(&self, port: u16) {
        self.cursors
            .write()
            .await
            .entry(port)
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)));
    }

    /// Claim the rotation start for one client of `port` over `len` backends.
    ///
    /// An untracked port starts at the first backend without gaining a cursor.
    pub async fn next_index(&self, port: u16, len: usize) -> Result<usize, RouterError> {
        if len == 0 {
            return Err(RouterError::NoBackendsAvailable { port });
        }

        let index = match self.cursors.read().await.get(&port) {
            Some(cursor) => cursor.fetch_add(1, Ordering::Relaxed) % len,
            None => 0,
        };

        debug!(port, index, backend_count = len, "Round-robin selected start");
        Ok(index)
    }

    /// Drop the cursor for a removed port.
    pub async fn forget(&self, port: u16) {
        self.cursors.write().await.remove(&port);
    }

    /// Ports with live cursor state.
    pub async fn tracked_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.cursors.read().await.keys().copied().collect();
        ports.sort_unstable();
        ports
    }
}

/// Backends to dial for one client: `attempts` entries starting at `start`.
pub fn rotation(
    backends: &[Endpoint],
    start: usize,
    attempts: usize,
) -> impl Iterator<Item = &Endpoint> + '_ {
    let len = backends.len();
    (0..attempts.min(len)).map(move |offset| &backends[(start + offset) % len])
}

impl Default for BackendSelector {
    fn default() -> Self {
        Self::new()
    }
}
