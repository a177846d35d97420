//! Bidirectional relay between one client and one backend connection.
//!
//! Each session runs one task per direction. A direction that reaches EOF
//! shuts down the write side of its destination (TCP half-close) and the
//! session keeps relaying the other direction until it finishes too.
//!
//! ```text
//! Established -> Relaying -> HalfClosed(dir) -> Closed
//!                    |                             ^
//!                    +--- error / idle / forced ---+
//! ```
//!
//! Both sockets are owned by the relay tasks, so they are released exactly
//! once on every exit path.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::backend::Endpoint;
use crate::error::RouterError;

/// Default idle timeout for a session.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default relay buffer size per direction.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Direction of a relay half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToBackend => write!(f, "client->backend"),
            Direction::BackendToClient => write!(f, "backend->client"),
        }
    }
}

/// Lifecycle state of a proxy session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Both sockets connected, nothing forwarded yet.
    Established,
    /// Both directions forwarding.
    Relaying,
    /// The source of `Direction` reached EOF; the other direction continues.
    HalfClosed(Direction),
    /// Terminal.
    Closed,
}

impl SessionState {
    /// State after the source of `direction` reached EOF.
    pub fn on_eof(self, direction: Direction) -> Self {
        match self {
            SessionState::Established | SessionState::Relaying => {
                SessionState::HalfClosed(direction)
            }
            SessionState::HalfClosed(done) if done != direction => SessionState::Closed,
            other => other,
        }
    }

    pub fn is_closed(self) -> bool {
        self == SessionState::Closed
    }
}

/// Per-session relay settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Close the session when no bytes flow either way for this long.
    pub idle_timeout: Option<Duration>,
    /// Read buffer size per direction.
    pub buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Both directions reached EOF.
    Completed,
    /// No traffic for the idle interval.
    IdleTimeout,
    /// A relay direction failed.
    RelayError(Direction),
    /// Closed by router shutdown after the drain grace period.
    ForceClosed,
}

/// Outcome of a finished session.
#[derive(Debug)]
pub struct SessionSummary {
    pub backend: Endpoint,
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
    pub duration: Duration,
    pub end: SessionEnd,
    /// Error detail for `IdleTimeout` and `RelayError`.
    pub error: Option<RouterError>,
}

/// Last-traffic clock shared by both relay directions.
struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.origin + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }
}

/// One in-flight client/backend relay.
pub struct ProxySession {
    client: TcpStream,
    backend: TcpStream,
    endpoint: Endpoint,
    config: SessionConfig,
    state: SessionState,
}

impl ProxySession {
    /// Create a session over two connected sockets.
    pub fn new(
        client: TcpStream,
        backend: TcpStream,
        endpoint: Endpoint,
        config: SessionConfig,
    ) -> Self {
        Self {
            client,
            backend,
            endpoint,
            config,
            state: SessionState::Established,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Relay until both directions finish, one fails, the session idles out,
    /// or `force_close` flips to true.
    pub async fn run(self, mut force_close: watch::Receiver<bool>) -> SessionSummary {
        let ProxySession {
            client,
            backend,
            endpoint,
            config,
            mut state,
        } = self;

        let started_at = Instant::now();
        let activity = Arc::new(Activity::new());
        let to_backend = Arc::new(AtomicU64::new(0));
        let from_backend = Arc::new(AtomicU64::new(0));

        let (client_read, client_write) = client.into_split();
        let (backend_read, backend_write) = backend.into_split();

        let mut upstream: JoinHandle<io::Result<()>> = tokio::spawn(pump(
            client_read,
            backend_write,
            config.buffer_size,
            Arc::clone(&activity),
            Arc::clone(&to_backend),
        ));
        let mut downstream: JoinHandle<io::Result<()>> = tokio::spawn(pump(
            backend_read,
            client_write,
            config.buffer_size,
            Arc::clone(&activity),
            Arc::clone(&from_backend),
        ));

        state = transition(state, SessionState::Relaying, &endpoint);

        let mut upstream_done = false;
        let mut downstream_done = false;
        let mut force_close_live = true;
        let mut end = SessionEnd::Completed;
        let mut error = None;

        if *force_close.borrow() {
            end = SessionEnd::ForceClosed;
        }

        while end == SessionEnd::Completed && !state.is_closed() {
            let idle_deadline = match config.idle_timeout {
                Some(idle) => activity.last() + idle,
                None => Instant::now() + Duration::from_secs(86_400),
            };

            tokio::select! {
                result = &mut upstream, if !upstream_done => {
                    upstream_done = true;
                    match flatten(result) {
                        Ok(()) => {
                            let next = state.on_eof(Direction::ClientToBackend);
                            state = transition(state, next, &endpoint);
                        }
                        Err(source) => {
                            end = SessionEnd::RelayError(Direction::ClientToBackend);
                            error = Some(RouterError::RelayIo {
                                direction: Direction::ClientToBackend,
                                source,
                            });
                        }
                    }
                }
                result = &mut downstream, if !downstream_done => {
                    downstream_done = true;
                    match flatten(result) {
                        Ok(()) => {
                            let next = state.on_eof(Direction::BackendToClient);
                            state = transition(state, next, &endpoint);
                        }
                        Err(source) => {
                            end = SessionEnd::RelayError(Direction::BackendToClient);
                            error = Some(RouterError::RelayIo {
                                direction: Direction::BackendToClient,
                                source,
                            });
                        }
                    }
                }
                _ = tokio::time::sleep_until(idle_deadline), if config.idle_timeout.is_some() => {
                    if let Some(idle) = config.idle_timeout {
                        if activity.last().elapsed() >= idle {
                            end = SessionEnd::IdleTimeout;
                            error = Some(RouterError::IdleTimeout { idle });
                        }
                    }
                }
                changed = force_close.changed(), if force_close_live => {
                    match changed {
                        Ok(()) if *force_close.borrow() => end = SessionEnd::ForceClosed,
                        Ok(()) => {}
                        Err(_) => force_close_live = false,
                    }
                }
            }
        }

        // Tear down whatever is still relaying; dropping the halves closes
        // the sockets.
        if !upstream_done {
            upstream.abort();
            let _ = upstream.await;
        }
        if !downstream_done {
            downstream.abort();
            let _ = downstream.await;
        }
        transition(state, SessionState::Closed, &endpoint);

        let summary = SessionSummary {
            backend: endpoint,
            bytes_to_backend: to_backend.load(Ordering::Relaxed),
            bytes_from_backend: from_backend.load(Ordering::Relaxed),
            duration: started_at.elapsed(),
            end,
            error,
        };

        debug!(
            backend = %summary.backend,
            bytes_to_backend = summary.bytes_to_backend,
            bytes_from_backend = summary.bytes_from_backend,
            duration_ms = summary.duration.as_millis() as u64,
            end = ?summary.end,
            "Session closed"
        );

        summary
    }
}

fn transition(from: SessionState, to: SessionState, endpoint: &Endpoint) -> SessionState {
    if from != to {
        debug!(backend = %endpoint, from = ?from, to = ?to, "Session state changed");
    }
    to
}

fn flatten(result: Result<io::Result<()>, tokio::task::JoinError>) -> io::Result<()> {
    match result {
        Ok(inner) => inner,
        Err(e) => Err(io::Error::other(e)),
    }
}

/// Copy one direction until EOF, then half-close the destination.
async fn pump(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    buffer_size: usize,
    activity: Arc<Activity>,
    counter: Arc<AtomicU64>,
) -> io::Result<()> {
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        activity.touch();
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        activity.touch();
    }

    match writer.shutdown().await {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

/// Counts in-flight sessions and carries the force-close signal.
#[derive(Debug)]
pub struct SessionTracker {
    active: AtomicUsize,
    idle: Notify,
    force_close: watch::Sender<bool>,
}

impl SessionTracker {
    pub fn new() -> Self {
        let (force_close, _) = watch::channel(false);
        Self {
            active: AtomicUsize::new(0),
            idle: Notify::new(),
            force_close,
        }
    }

    /// Register a session; the count drops when the ticket is dropped.
    pub fn track(self: &Arc<Self>) -> SessionTicket {
        self.active.fetch_add(1, Ordering::AcqRel);
        SessionTicket {
            tracker: Arc::clone(self),
        }
    }

    /// Number of sessions still running.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Receiver handed to each session.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.force_close.subscribe()
    }

    /// Signal every running (and future) session to close.
    pub fn force_close_all(&self) {
        self.force_close.send_replace(true);
    }

    /// Wait until no session is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard for one tracked session.
#[derive(Debug)]
pub struct SessionTicket {
    tracker: Arc<SessionTracker>,
}

impl Drop for SessionTicket {
    fn drop(&mut self) {
        if self.tracker.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}
