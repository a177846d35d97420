//! Per-port accept loop and connection dispatch.
//!
//! One dispatcher owns the listening socket of one external port. Every
//! accepted client is handled on its own task: snapshot the port's backends,
//! pick one round-robin, dial it (moving on to the next backend on failure),
//! then relay until the session ends. A client that cannot be routed is closed
//! immediately without data.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use super::backend::{dial, rotation, BackendSelector, Endpoint, DEFAULT_CONNECT_TIMEOUT};
use super::session::{ProxySession, SessionConfig, SessionEnd, SessionTracker};
use super::table::RoutingTable;
use crate::error::RouterError;

/// Default maximum concurrent connections per port.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default number of backends tried per client connection.
pub const DEFAULT_MAX_DIAL_ATTEMPTS: usize = 3;

/// Dispatch settings shared by every port.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Bound on each backend dial.
    pub connect_timeout: Duration,
    /// Backends tried before the client is closed.
    pub max_dial_attempts: usize,
    /// Maximum concurrent connections per port.
    pub max_connections: usize,
    /// Relay settings.
    pub session: SessionConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_dial_attempts: DEFAULT_MAX_DIAL_ATTEMPTS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            session: SessionConfig::default(),
        }
    }
}

/// Counters for one dispatcher.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being dispatched or relayed.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Connections closed because the port had no backends.
    pub no_backends: AtomicU64,
    /// Individual backend dial failures.
    pub dial_failures: AtomicU64,
    /// Connections that reached a backend.
    pub routed: AtomicU64,
    /// Sessions closed by the idle timeout.
    pub sessions_timed_out: AtomicU64,
    /// Sessions closed by a relay error.
    pub relay_errors: AtomicU64,
    /// Bytes proxied to backends.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backends.
    pub bytes_from_backend: AtomicU64,
}

impl DispatcherStats {
    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> PortStats {
        PortStats {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            no_backends: self.no_backends.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            routed: self.routed.load(Ordering::Relaxed),
            sessions_timed_out: self.sessions_timed_out.load(Ordering::Relaxed),
            relay_errors: self.relay_errors.load(Ordering::Relaxed),
            bytes_to_backend: self.bytes_to_backend.load(Ordering::Relaxed),
            bytes_from_backend: self.bytes_from_backend.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`DispatcherStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStats {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_closed: u64,
    pub connections_rejected: u64,
    pub no_backends: u64,
    pub dial_failures: u64,
    pub routed: u64,
    pub sessions_timed_out: u64,
    pub relay_errors: u64,
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
}

/// State shared by the accept loop and its connection tasks.
///
/// Connection tasks never hold the listening socket, so dropping the
/// dispatcher closes the port while sessions keep running.
struct DispatchContext {
    port: u16,
    table: Arc<RoutingTable>,
    selector: Arc<BackendSelector>,
    sessions: Arc<SessionTracker>,
    config: DispatchConfig,
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<DispatcherStats>,
}

/// Accept loop for one external port.
pub struct ConnectionDispatcher {
    listener: TcpListener,
    ctx: Arc<DispatchContext>,
}

impl ConnectionDispatcher {
    /// Bind the listening socket for `port`.
    pub async fn bind(
        bind_ip: IpAddr,
        port: u16,
        table: Arc<RoutingTable>,
        selector: Arc<BackendSelector>,
        sessions: Arc<SessionTracker>,
        config: DispatchConfig,
    ) -> Result<Self, RouterError> {
        let listener = TcpListener::bind(SocketAddr::new(bind_ip, port))
            .await
            .map_err(|source| RouterError::ListenerBind { port, source })?;

        info!(
            port,
            bind_ip = %bind_ip,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            listener,
            ctx: Arc::new(DispatchContext {
                port,
                table,
                selector,
                sessions,
                conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
                config,
                stats: Arc::new(DispatcherStats::default()),
            }),
        })
    }

    /// Get the local address this dispatcher is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn port(&self) -> u16 {
        self.ctx.port
    }

    /// Get dispatcher statistics.
    pub fn stats(&self) -> Arc<DispatcherStats> {
        Arc::clone(&self.ctx.stats)
    }

    /// Accept until `stop` flips to true (or its sender goes away).
    ///
    /// Returning drops the listening socket; in-flight connections continue.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        let port = self.ctx.port;
        info!(port, "Dispatcher started");

        while !*stop.borrow() {
            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => self.spawn_connection(stream, peer_addr),
                    Err(e) => {
                        error!(port, error = %e, "Accept error");
                        // Brief sleep to avoid tight loop on persistent errors
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        info!(port, "Dispatcher stopped accepting");
    }

    fn spawn_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let ctx = Arc::clone(&self.ctx);

        let permit = match Arc::clone(&ctx.conn_semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                ctx.stats
                    .connections_rejected
                    .fetch_add(1, Ordering::Relaxed);
                warn!(port = ctx.port, peer_addr = %peer_addr, "Connection rejected: max connections reached");
                return;
            }
        };

        ctx.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        ctx.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        let ticket = ctx.sessions.track();
        let span = tracing::info_span!("connection", port = ctx.port, peer = %peer_addr);

        tokio::spawn(
            async move {
                if let Err(e) = handle_connection(&ctx, stream).await {
                    debug!(error = %e, reason = e.reason_code(), "Connection closed without routing");
                }

                ctx.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                ctx.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                drop(ticket);
                drop(permit);
            }
            .instrument(span),
        );
    }
}

/// Route one client connection and relay it to completion.
async fn handle_connection(ctx: &DispatchContext, client: TcpStream) -> Result<(), RouterError> {
    let port = ctx.port;
    let backends = ctx.table.snapshot(port);

    let (backend, endpoint) = match connect_backend(ctx, &backends).await {
        Ok(connected) => connected,
        Err(e) => {
            if matches!(e, RouterError::NoBackendsAvailable { .. }) {
                ctx.stats.no_backends.fetch_add(1, Ordering::Relaxed);
            }
            warn!(port, reason = e.reason_code(), error = %e, "Closing unroutable client");
            return Err(e);
        }
    };

    ctx.stats.routed.fetch_add(1, Ordering::Relaxed);
    debug!(backend = %endpoint, "Connected to backend");

    let session = ProxySession::new(client, backend, endpoint, ctx.config.session.clone());
    let summary = session.run(ctx.sessions.subscribe()).await;

    ctx.stats
        .bytes_to_backend
        .fetch_add(summary.bytes_to_backend, Ordering::Relaxed);
    ctx.stats
        .bytes_from_backend
        .fetch_add(summary.bytes_from_backend, Ordering::Relaxed);

    match summary.end {
        SessionEnd::IdleTimeout => {
            ctx.stats.sessions_timed_out.fetch_add(1, Ordering::Relaxed);
        }
        SessionEnd::RelayError(_) => {
            ctx.stats.relay_errors.fetch_add(1, Ordering::Relaxed);
        }
        SessionEnd::Completed | SessionEnd::ForceClosed => {}
    }

    if let Some(e) = &summary.error {
        debug!(backend = %summary.backend, reason = e.reason_code(), error = %e, "Session ended abnormally");
    }

    Ok(())
}

/// Dial backends in rotation order, up to the configured attempt budget.
///
/// One rotation start is claimed per client, so concurrent clients never make
/// this client skip past a backend it has not tried.
async fn connect_backend(
    ctx: &DispatchContext,
    backends: &[Endpoint],
) -> Result<(TcpStream, Endpoint), RouterError> {
    let port = ctx.port;
    let start = ctx.selector.next_index(port, backends.len()).await?;
    let attempts = ctx.config.max_dial_attempts.clamp(1, backends.len());

    for (attempt, endpoint) in rotation(backends, start, attempts).enumerate() {
        match dial(endpoint, ctx.config.connect_timeout).await {
            Ok(stream) => return Ok((stream, endpoint.clone())),
            Err(e) if e.is_dial_failure() => {
                ctx.stats.dial_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    port,
                    backend = %endpoint,
                    attempt = attempt + 1,
                    reason = e.reason_code(),
                    error = %e,
                    "Backend connection failed"
                );
            }
            Err(e) => return Err(e),
        }
    }

    Err(RouterError::AllDialsFailed { port, attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    async fn free_port() -> u16 {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn spawn_dispatcher(
        table: Arc<RoutingTable>,
        config: DispatchConfig,
    ) -> (u16, Arc<DispatcherStats>, watch::Sender<bool>) {
        let port = free_port().await;
        let selector = Arc::new(BackendSelector::new());
        selector.register(port).await;
        let dispatcher = ConnectionDispatcher::bind(
            LOCALHOST,
            port,
            table,
            selector,
            Arc::new(SessionTracker::new()),
            config,
        )
        .await
        .unwrap();
        let stats = dispatcher.stats();
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(dispatcher.run(stop_rx));
        (port, stats, stop_tx)
    }

    #[test]
    fn test_dispatch_config_default() {
        let config = DispatchConfig::default();
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.max_dial_attempts, DEFAULT_MAX_DIAL_ATTEMPTS);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
    }

    #[tokio::test]
    async fn test_unroutable_port_closes_client_immediately() {
        let table = Arc::new(RoutingTable::new());
        let (port, stats, _stop) = spawn_dispatcher(Arc::clone(&table), DispatchConfig::default()).await;
        table.add_port(port);

        let mut client = TcpStream::connect((LOCALHOST, port)).await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("client hung")
            .unwrap_or(0);
        assert_eq!(n, 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(stats.no_backends.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_dial_failure_moves_to_next_backend() {
        let live = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let live_addr = live.local_addr().unwrap();
        let dead_port = free_port().await;

        let table = Arc::new(RoutingTable::new());
        let (port, stats, _stop) = spawn_dispatcher(Arc::clone(&table), DispatchConfig::default()).await;
        table.upsert_backend(port, Endpoint::new("127.0.0.1", dead_port));
        table.upsert_backend(port, Endpoint::from(live_addr));

        tokio::spawn(async move {
            let (mut stream, _) = live.accept().await.unwrap();
            stream.write_all(b"live").await.unwrap();
        });

        let mut client = TcpStream::connect((LOCALHOST, port)).await.unwrap();
        let mut buf = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut buf))
            .await
            .expect("client hung")
            .unwrap();
        assert_eq!(&buf, b"live");
        assert_eq!(stats.dial_failures.load(Ordering::Relaxed), 1);
        assert_eq!(stats.routed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_clients_fall_through_dead_backend() {
        const CLIENTS: usize = 200;

        let live = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let live_addr = live.local_addr().unwrap();
        let dead_port = free_port().await;

        let table = Arc::new(RoutingTable::new());
        let (port, stats, _stop) =
            spawn_dispatcher(Arc::clone(&table), DispatchConfig::default()).await;
        table.upsert_backend(port, Endpoint::new("127.0.0.1", dead_port));
        table.upsert_backend(port, Endpoint::from(live_addr));

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = live.accept().await {
                tokio::spawn(async move {
                    let _ = stream.write_all(b"live").await;
                });
            }
        });

        let clients: Vec<_> = (0..CLIENTS)
            .map(|_| {
                tokio::spawn(async move {
                    let mut client = TcpStream::connect((LOCALHOST, port)).await.unwrap();
                    let mut buf = [0u8; 4];
                    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
                        .await
                        .expect("client hung")
                        .map(|_| buf)
                })
            })
            .collect();

        let mut closed_without_data = 0;
        for client in clients {
            match client.await.unwrap() {
                Ok(buf) => assert_eq!(&buf, b"live"),
                Err(_) => closed_without_data += 1,
            }
        }

        assert_eq!(closed_without_data, 0);
        assert_eq!(stats.routed.load(Ordering::Relaxed), CLIENTS as u64);
        // Every other rotation start lands on the dead backend.
        assert_eq!(stats.dial_failures.load(Ordering::Relaxed), (CLIENTS / 2) as u64);
    }

    #[tokio::test]
    async fn test_stop_closes_listener() {
        let table = Arc::new(RoutingTable::new());
        let (port, _stats, stop) = spawn_dispatcher(table, DispatchConfig::default()).await;

        stop.send_replace(true);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(TcpStream::connect((LOCALHOST, port)).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let occupied = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let port = occupied.local_addr().unwrap().port();

        let result = ConnectionDispatcher::bind(
            LOCALHOST,
            port,
            Arc::new(RoutingTable::new()),
            Arc::new(BackendSelector::new()),
            Arc::new(SessionTracker::new()),
            DispatchConfig::default(),
        )
        .await;

        match result {
            Err(RouterError::ListenerBind { port: p, .. }) => assert_eq!(p, port),
            Err(other) => panic!("Expected ListenerBind, got {:?}", other),
            Ok(_) => panic!("Expected ListenerBind, got a bound dispatcher"),
        }
    }
}
