//! Router: owns the listeners and applies control-plane commands.
//!
//! The router runs as a single task with a mailbox. It is the only writer of
//! the routing table: every `ControlCommand` is applied here, after which the
//! set of live listeners is reconciled against the table's port set.
//!
//! - New port: bind a dispatcher (bind failures retried with backoff)
//! - Removed port: stop accepting immediately, let sessions drain naturally
//! - Shutdown: stop every listener, wait up to the grace period, then
//!   force-close what is left

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tcpr_events::MappingEvent;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::backend::{BackendSelector, Endpoint};
use super::dispatcher::{ConnectionDispatcher, DispatchConfig, DispatcherStats, PortStats};
use super::session::SessionTracker;
use super::table::RoutingTable;
use crate::error::RouterError;

/// Default grace period for draining sessions on shutdown.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Router mailbox capacity.
const MAILBOX_CAPACITY: usize = 1024;

/// How often dispatcher tasks and pending binds are checked.
const SUPERVISE_INTERVAL: Duration = Duration::from_millis(100);

/// How long force-closed sessions get to finish tearing down.
const FORCE_CLOSE_WAIT: Duration = Duration::from_secs(1);

/// A control-plane mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    AddPort(u16),
    RemovePort(u16),
    AttachBackend { port: u16, endpoint: Endpoint },
    DetachBackend { port: u16, endpoint: Endpoint },
}

impl ControlCommand {
    /// External port the command targets.
    pub fn port(&self) -> u16 {
        match self {
            ControlCommand::AddPort(port) | ControlCommand::RemovePort(port) => *port,
            ControlCommand::AttachBackend { port, .. }
            | ControlCommand::DetachBackend { port, .. } => *port,
        }
    }
}

impl From<MappingEvent> for ControlCommand {
    fn from(event: MappingEvent) -> Self {
        match event {
            MappingEvent::PortAdded(p) => ControlCommand::AddPort(p.external_port),
            MappingEvent::PortRemoved(p) => ControlCommand::RemovePort(p.external_port),
            MappingEvent::BackendAttached(p) => ControlCommand::AttachBackend {
                port: p.external_port,
                endpoint: Endpoint::new(p.host, p.port),
            },
            MappingEvent::BackendDetached(p) => ControlCommand::DetachBackend {
                port: p.external_port,
                endpoint: Endpoint::new(p.host, p.port),
            },
        }
    }
}

/// Exponential backoff for listener bind retries.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,
    /// Maximum delay.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// IP every external port is bound on.
    pub bind_ip: IpAddr,
    /// Per-connection dispatch settings.
    pub dispatch: DispatchConfig,
    /// How long shutdown waits for sessions before force-closing them.
    pub drain_grace: Duration,
    /// Retry policy for failed binds.
    pub bind_backoff: BackoffPolicy,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dispatch: DispatchConfig::default(),
            drain_grace: DEFAULT_DRAIN_GRACE,
            bind_backoff: BackoffPolicy::default(),
        }
    }
}

/// Result of a router shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Sessions that finished on their own within the grace period.
    pub drained: usize,
    /// Sessions closed after the grace period expired.
    pub force_closed: usize,
}

enum RouterMessage {
    Control {
        command: ControlCommand,
        reply: Option<oneshot::Sender<Result<(), RouterError>>>,
    },
    ListeningPorts {
        reply: oneshot::Sender<Vec<(u16, SocketAddr)>>,
    },
    PortStats {
        port: u16,
        reply: oneshot::Sender<Option<PortStats>>,
    },
    Shutdown {
        reply: oneshot::Sender<ShutdownReport>,
    },
}

/// A bound dispatcher and the means to stop it.
struct ActiveListener {
    local_addr: SocketAddr,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    stats: Arc<DispatcherStats>,
}

/// A registered port whose listener is not bound yet.
struct PendingBind {
    attempts: u32,
    retry_at: Instant,
}

/// Process-wide routing engine.
pub struct Router {
    config: RouterConfig,
    table: Arc<RoutingTable>,
    selector: Arc<BackendSelector>,
    sessions: Arc<SessionTracker>,
    listeners: HashMap<u16, ActiveListener>,
    pending: BTreeMap<u16, PendingBind>,
}

impl Router {
    /// Create a router with an empty routing table.
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            table: Arc::new(RoutingTable::new()),
            selector: Arc::new(BackendSelector::new()),
            sessions: Arc::new(SessionTracker::new()),
            listeners: HashMap::new(),
            pending: BTreeMap::new(),
        }
    }

    /// Start the router task and return its handle.
    ///
    /// The router shuts down (gracefully) once every handle is dropped.
    pub fn spawn(self) -> RouterHandle {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let handle = RouterHandle {
            tx,
            table: Arc::clone(&self.table),
            sessions: Arc::clone(&self.sessions),
        };
        tokio::spawn(self.run(rx));
        handle
    }

    async fn run(mut self, mut mailbox: mpsc::Receiver<RouterMessage>) {
        info!(bind_ip = %self.config.bind_ip, "Router started");

        let mut supervise = tokio::time::interval(SUPERVISE_INTERVAL);
        supervise.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = mailbox.recv() => match message {
                    Some(RouterMessage::Control { command, reply }) => {
                        let result = self.apply(command).await;
                        if let Some(reply) = reply {
                            let _ = reply.send(result);
                        }
                    }
                    Some(RouterMessage::ListeningPorts { reply }) => {
                        let mut ports: Vec<(u16, SocketAddr)> = self
                            .listeners
                            .iter()
                            .map(|(port, l)| (*port, l.local_addr))
                            .collect();
                        ports.sort_unstable();
                        let _ = reply.send(ports);
                    }
                    Some(RouterMessage::PortStats { port, reply }) => {
                        let stats = self.listeners.get(&port).map(|l| l.stats.snapshot());
                        let _ = reply.send(stats);
                    }
                    Some(RouterMessage::Shutdown { reply }) => {
                        let report = self.shutdown().await;
                        let _ = reply.send(report);
                        break;
                    }
                    None => {
                        info!("All router handles dropped");
                        self.shutdown().await;
                        break;
                    }
                },
                _ = supervise.tick() => self.supervise().await,
            }
        }

        info!("Router stopped");
    }

    /// Apply one command to the table, then converge the listeners.
    async fn apply(&mut self, command: ControlCommand) -> Result<(), RouterError> {
        let port = command.port();

        match command {
            ControlCommand::AddPort(port) => {
                let added = self.table.add_port(port);
                info!(port, added, "Port added");
            }
            ControlCommand::RemovePort(port) => {
                let existed = self.table.remove_port(port);
                info!(port, existed, "Port removed");
            }
            ControlCommand::AttachBackend { port, endpoint } => {
                let added = self.table.upsert_backend(port, endpoint.clone());
                info!(
                    port,
                    backend = %endpoint,
                    added,
                    backend_count = self.table.snapshot(port).len(),
                    "Backend attached"
                );
            }
            ControlCommand::DetachBackend { port, endpoint } => {
                let removed = self.table.remove_backend(port, &endpoint);
                let remaining = self.table.snapshot(port).len();
                if removed && remaining == 0 {
                    warn!(port, backend = %endpoint, "Last backend detached; port is unroutable");
                } else {
                    info!(port, backend = %endpoint, removed, backend_count = remaining, "Backend detached");
                }
            }
        }

        // Rotation state lives exactly as long as the port's mapping.
        if self.table.contains_port(port) {
            self.selector.register(port).await;
        } else {
            self.selector.forget(port).await;
        }

        let mut failures = self.reconcile_listeners().await;
        match failures.remove(&port) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Make the live listeners match the table's port set.
    ///
    /// Returns the bind failures of this pass keyed by port.
    async fn reconcile_listeners(&mut self) -> HashMap<u16, RouterError> {
        let desired: BTreeSet<u16> = self.table.ports().into_iter().collect();

        let stale: Vec<u16> = self
            .listeners
            .keys()
            .filter(|port| !desired.contains(port))
            .copied()
            .collect();
        for port in stale {
            self.stop_listener(port).await;
        }
        self.pending.retain(|port, _| desired.contains(port));

        let mut failures = HashMap::new();
        for port in desired {
            if self.listeners.contains_key(&port) || self.pending.contains_key(&port) {
                continue;
            }
            if let Err(e) = self.start_listener(port).await {
                failures.insert(port, e);
            }
        }
        failures
    }

    /// Restart dispatchers that died and retry binds that are due.
    async fn supervise(&mut self) {
        let dead: Vec<u16> = self
            .listeners
            .iter()
            .filter(|(_, l)| l.task.is_finished())
            .map(|(port, _)| *port)
            .collect();
        for port in dead {
            if let Some(listener) = self.listeners.remove(&port) {
                if let Err(e) = listener.task.await {
                    error!(port, error = %e, "Dispatcher task failed");
                }
            }
            warn!(port, "Dispatcher exited unexpectedly; rebinding");
            self.pending.insert(
                port,
                PendingBind {
                    attempts: 0,
                    retry_at: Instant::now(),
                },
            );
        }

        let now = Instant::now();
        let due: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, p)| p.retry_at <= now)
            .map(|(port, _)| *port)
            .collect();
        for port in due {
            if self.table.contains_port(port) {
                let _ = self.start_listener(port).await;
            } else {
                self.pending.remove(&port);
            }
        }
    }

    async fn start_listener(&mut self, port: u16) -> Result<(), RouterError> {
        let bound = ConnectionDispatcher::bind(
            self.config.bind_ip,
            port,
            Arc::clone(&self.table),
            Arc::clone(&self.selector),
            Arc::clone(&self.sessions),
            self.config.dispatch.clone(),
        )
        .await;

        let dispatcher = match bound {
            Ok(dispatcher) => dispatcher,
            Err(e) => {
                let attempts = self.pending.get(&port).map_or(0, |p| p.attempts) + 1;
                let delay = self.config.bind_backoff.delay(attempts - 1);
                error!(
                    port,
                    attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    reason = e.reason_code(),
                    error = %e,
                    "Failed to bind listener"
                );
                self.pending.insert(
                    port,
                    PendingBind {
                        attempts,
                        retry_at: Instant::now() + delay,
                    },
                );
                return Err(e);
            }
        };

        let local_addr = dispatcher
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::new(self.config.bind_ip, port));
        let stats = dispatcher.stats();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(dispatcher.run(stop_rx));

        self.pending.remove(&port);
        self.listeners.insert(
            port,
            ActiveListener {
                local_addr,
                stop_tx,
                task,
                stats,
            },
        );
        Ok(())
    }

    /// Stop accepting on `port`; sessions already relaying are left alone.
    async fn stop_listener(&mut self, port: u16) {
        let Some(listener) = self.listeners.remove(&port) else {
            return;
        };

        listener.stop_tx.send_replace(true);
        if let Err(e) = listener.task.await {
            error!(port, error = %e, "Dispatcher task failed");
        }

        let stats = listener.stats.snapshot();
        info!(
            port,
            draining = stats.connections_active,
            "Listener closed"
        );
    }

    async fn shutdown(&mut self) -> ShutdownReport {
        let ports: Vec<u16> = self.listeners.keys().copied().collect();
        for port in ports {
            self.stop_listener(port).await;
        }
        self.pending.clear();

        let in_flight = self.sessions.active();
        info!(
            in_flight,
            grace_ms = self.config.drain_grace.as_millis() as u64,
            "Draining sessions"
        );

        let drained = tokio::time::timeout(self.config.drain_grace, self.sessions.wait_idle())
            .await
            .is_ok();

        let force_closed = if drained {
            0
        } else {
            let remaining = self.sessions.active();
            warn!(remaining, "Drain grace expired; force-closing sessions");
            self.sessions.force_close_all();
            if tokio::time::timeout(FORCE_CLOSE_WAIT, self.sessions.wait_idle())
                .await
                .is_err()
            {
                error!(remaining = self.sessions.active(), "Sessions still open after force close");
            }
            remaining
        };

        let report = ShutdownReport {
            drained: in_flight.saturating_sub(force_closed),
            force_closed,
        };
        info!(
            drained = report.drained,
            force_closed = report.force_closed,
            "Router shutdown complete"
        );
        report
    }
}

/// Cloneable handle to a running [`Router`].
#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::Sender<RouterMessage>,
    table: Arc<RoutingTable>,
    sessions: Arc<SessionTracker>,
}

impl RouterHandle {
    /// Apply a command and wait for the outcome.
    ///
    /// The table mutation always takes effect; an error reports a listener
    /// that could not be bound (it will be retried).
    pub async fn apply(&self, command: ControlCommand) -> Result<(), RouterError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RouterMessage::Control {
                command,
                reply: Some(reply),
            })
            .await
            .map_err(|_| RouterError::RouterStopped)?;
        rx.await.map_err(|_| RouterError::RouterStopped)?
    }

    /// Queue a command without waiting for it to be applied.
    pub async fn notify(&self, command: ControlCommand) -> Result<(), RouterError> {
        debug!(command = ?command, "Queueing control command");
        self.tx
            .send(RouterMessage::Control {
                command,
                reply: None,
            })
            .await
            .map_err(|_| RouterError::RouterStopped)
    }

    /// Ports with a live listener and the address each is bound to.
    pub async fn listening_ports(&self) -> Result<Vec<(u16, SocketAddr)>, RouterError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RouterMessage::ListeningPorts { reply })
            .await
            .map_err(|_| RouterError::RouterStopped)?;
        rx.await.map_err(|_| RouterError::RouterStopped)
    }

    /// Counters of the dispatcher for `port`, if it is listening.
    pub async fn port_stats(&self, port: u16) -> Result<Option<PortStats>, RouterError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RouterMessage::PortStats { port, reply })
            .await
            .map_err(|_| RouterError::RouterStopped)?;
        rx.await.map_err(|_| RouterError::RouterStopped)
    }

    /// Connections currently being dispatched or relayed, across all ports.
    pub fn active_sessions(&self) -> usize {
        self.sessions.active()
    }

    /// Read-only view of the routing table.
    pub fn table(&self) -> Arc<RoutingTable> {
        Arc::clone(&self.table)
    }

    /// Stop all listeners, drain sessions, and stop the router.
    pub async fn shutdown(&self) -> Result<ShutdownReport, RouterError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RouterMessage::Shutdown { reply })
            .await
            .map_err(|_| RouterError::RouterStopped)?;
        rx.await.map_err(|_| RouterError::RouterStopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tcpr_events::{BackendAttachedPayload, PortRemovedPayload};
    use tokio::net::{TcpListener, TcpStream};

    fn local_config() -> RouterConfig {
        RouterConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            drain_grace: Duration::from_millis(200),
            ..RouterConfig::default()
        }
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_backoff_delay() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(20), Duration::from_secs(30));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_command_from_mapping_event() {
        let command = ControlCommand::from(MappingEvent::BackendAttached(BackendAttachedPayload {
            external_port: 61001,
            host: "10.0.0.5".to_string(),
            port: 3333,
            instance_id: Some("inst-1".to_string()),
        }));
        assert_eq!(
            command,
            ControlCommand::AttachBackend {
                port: 61001,
                endpoint: Endpoint::new("10.0.0.5", 3333),
            }
        );

        let command = ControlCommand::from(MappingEvent::PortRemoved(PortRemovedPayload {
            external_port: 61001,
        }));
        assert_eq!(command, ControlCommand::RemovePort(61001));
        assert_eq!(command.port(), 61001);
    }

    #[tokio::test]
    async fn test_listeners_follow_port_set() {
        let router = Router::new(local_config()).spawn();
        let port = free_port().await;

        router.apply(ControlCommand::AddPort(port)).await.unwrap();
        let ports = router.listening_ports().await.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].0, port);
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_ok());

        router.apply(ControlCommand::RemovePort(port)).await.unwrap();
        assert!(router.listening_ports().await.unwrap().is_empty());
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
        assert!(!router.table().contains_port(port));
    }

    #[tokio::test]
    async fn test_rotation_follows_port_lifecycle() {
        let router = Router::new(local_config());
        let selector = Arc::clone(&router.selector);
        let router = router.spawn();
        let port = free_port().await;
        let set = vec![Endpoint::new("127.0.0.1", 3333), Endpoint::new("127.0.0.1", 3334)];

        router.apply(ControlCommand::AddPort(port)).await.unwrap();
        assert_eq!(selector.tracked_ports().await, vec![port]);
        assert_eq!(selector.next_index(port, set.len()).await.unwrap(), 0);

        router.apply(ControlCommand::RemovePort(port)).await.unwrap();
        assert!(selector.tracked_ports().await.is_empty());

        // A client still dispatching on the removed port leaves no cursor behind.
        assert_eq!(selector.next_index(port, set.len()).await.unwrap(), 0);
        assert!(selector.tracked_ports().await.is_empty());

        router.apply(ControlCommand::AddPort(port)).await.unwrap();
        assert_eq!(selector.next_index(port, set.len()).await.unwrap(), 0);
        assert_eq!(selector.next_index(port, set.len()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_attach_to_unknown_port_opens_listener() {
        let router = Router::new(local_config()).spawn();
        let port = free_port().await;

        router
            .apply(ControlCommand::AttachBackend {
                port,
                endpoint: Endpoint::new("127.0.0.1", 3333),
            })
            .await
            .unwrap();

        assert!(router.port_stats(port).await.unwrap().is_some());
        assert_eq!(router.table().snapshot(port).len(), 1);
    }

    #[tokio::test]
    async fn test_detaching_last_backend_keeps_listener() {
        let router = Router::new(local_config()).spawn();
        let port = free_port().await;
        let endpoint = Endpoint::new("127.0.0.1", 3333);

        router
            .apply(ControlCommand::AttachBackend {
                port,
                endpoint: endpoint.clone(),
            })
            .await
            .unwrap();
        router
            .apply(ControlCommand::DetachBackend { port, endpoint })
            .await
            .unwrap();

        let ports = router.listening_ports().await.unwrap();
        assert_eq!(ports.iter().map(|(p, _)| *p).collect::<Vec<_>>(), vec![port]);
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported_and_retried() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();

        let mut config = local_config();
        config.bind_backoff = BackoffPolicy {
            base: Duration::from_millis(20),
            max: Duration::from_millis(50),
        };
        let router = Router::new(config).spawn();

        let err = router.apply(ControlCommand::AddPort(port)).await.unwrap_err();
        assert!(matches!(err, RouterError::ListenerBind { .. }), "{err:?}");
        assert!(router.table().contains_port(port));

        drop(occupied);

        let mut bound = false;
        for _ in 0..50 {
            if !router.listening_ports().await.unwrap().is_empty() {
                bound = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(bound, "listener was never rebound");
    }

    #[tokio::test]
    async fn test_shutdown_with_no_sessions() {
        let router = Router::new(local_config()).spawn();
        let port = free_port().await;
        router.apply(ControlCommand::AddPort(port)).await.unwrap();

        let report = router.shutdown().await.unwrap();
        assert_eq!(report, ShutdownReport::default());

        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
        assert!(matches!(
            router.apply(ControlCommand::AddPort(port)).await,
            Err(RouterError::RouterStopped)
        ));
    }
}
