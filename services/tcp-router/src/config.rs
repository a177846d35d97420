//! TCP router configuration.
//!
//! Everything is env-driven; the engine itself only sees [`RouterConfig`].

use std::{net::IpAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result};

use crate::proxy::{BackoffPolicy, DispatchConfig, RouterConfig, SessionConfig};

/// Smallest relay buffer accepted.
const MIN_RELAY_BUFFER_BYTES: usize = 512;

const INTEGER: &str = "an integer";
const MILLIS: &str = "an integer (milliseconds)";

/// Event feed settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Control plane base URL (example: http://localhost:8080).
    pub control_plane_url: String,

    /// Optional bearer token for the control plane.
    pub control_plane_token: Option<String>,

    /// Max events to fetch per poll.
    pub fetch_limit: i64,

    /// Poll interval when no new events are available.
    pub poll_interval: Duration,

    /// Exit once fully caught up.
    pub once: bool,
}

/// TCP router configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// IP every external port is bound on.
    pub bind_addr: IpAddr,

    /// Bound on each backend dial.
    pub connect_timeout: Duration,

    /// Session idle timeout; `None` disables it.
    pub idle_timeout: Option<Duration>,

    /// Backends tried per client before giving up.
    pub max_dial_attempts: usize,

    /// Shutdown grace before remaining sessions are force-closed.
    pub drain_grace: Duration,

    /// Maximum concurrent connections per port.
    pub max_connections: usize,

    /// Relay buffer size per direction.
    pub relay_buffer_bytes: usize,

    /// Optional static mappings applied at startup.
    pub mappings_file: Option<PathBuf>,

    /// Event feed settings; `None` when no control plane is configured.
    pub sync: Option<SyncConfig>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_addr = parse_var(&lookup, "TCPR_BIND_ADDR", "an IP address")?
            .unwrap_or_else(|| IpAddr::from([0, 0, 0, 0]));

        let connect_timeout_ms = parse_var::<_, u64>(&lookup, "TCPR_CONNECT_TIMEOUT_MS", MILLIS)?
            .unwrap_or(2000);
        let connect_timeout = Duration::from_millis(connect_timeout_ms.max(1));

        let idle_timeout_ms =
            parse_var::<_, u64>(&lookup, "TCPR_IDLE_TIMEOUT_MS", MILLIS)?.unwrap_or(300_000);
        let idle_timeout = (idle_timeout_ms > 0).then(|| Duration::from_millis(idle_timeout_ms));

        let max_dial_attempts = parse_var::<_, usize>(&lookup, "TCPR_MAX_DIAL_ATTEMPTS", INTEGER)?
            .unwrap_or(3)
            .max(1);

        let drain_grace_ms =
            parse_var::<_, u64>(&lookup, "TCPR_DRAIN_GRACE_MS", MILLIS)?.unwrap_or(10_000);
        let drain_grace = Duration::from_millis(drain_grace_ms);

        let max_connections = parse_var::<_, usize>(&lookup, "TCPR_MAX_CONNECTIONS", INTEGER)?
            .unwrap_or(10_000)
            .max(1);

        let relay_buffer_bytes = parse_var::<_, usize>(&lookup, "TCPR_RELAY_BUFFER_BYTES", INTEGER)?
            .unwrap_or(16 * 1024)
            .max(MIN_RELAY_BUFFER_BYTES);

        let mappings_file = non_empty(&lookup, "TCPR_MAPPINGS_FILE").map(PathBuf::from);

        let sync = match non_empty(&lookup, "TCPR_CONTROL_PLANE_URL") {
            Some(control_plane_url) => {
                let fetch_limit = parse_var::<_, i64>(&lookup, "TCPR_SYNC_LIMIT", INTEGER)?
                    .unwrap_or(200)
                    .clamp(1, 200);

                let poll_interval_ms =
                    parse_var::<_, u64>(&lookup, "TCPR_SYNC_POLL_INTERVAL_MS", MILLIS)?
                        .unwrap_or(1000);

                let once = lookup("TCPR_SYNC_ONCE")
                    .map(|v| v == "1" || v.to_lowercase() == "true")
                    .unwrap_or(false);

                Some(SyncConfig {
                    control_plane_url,
                    control_plane_token: non_empty(&lookup, "TCPR_CONTROL_PLANE_TOKEN"),
                    fetch_limit,
                    poll_interval: Duration::from_millis(poll_interval_ms.max(50)),
                    once,
                })
            }
            None => None,
        };

        let log_level = lookup("TCPR_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            bind_addr,
            connect_timeout,
            idle_timeout,
            max_dial_attempts,
            drain_grace,
            max_connections,
            relay_buffer_bytes,
            mappings_file,
            sync,
            log_level,
        })
    }

    /// Engine configuration derived from this config.
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            bind_ip: self.bind_addr,
            dispatch: DispatchConfig {
                connect_timeout: self.connect_timeout,
                max_dial_attempts: self.max_dial_attempts,
                max_connections: self.max_connections,
                session: SessionConfig {
                    idle_timeout: self.idle_timeout,
                    buffer_size: self.relay_buffer_bytes,
                },
            },
            drain_grace: self.drain_grace,
            bind_backoff: BackoffPolicy::default(),
        }
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<F, T>(lookup: &F, key: &str, expected: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    non_empty(lookup, key)
        .map(|v| v.parse::<T>())
        .transpose()
        .with_context(|| format!("{key} must be {expected}."))
}
