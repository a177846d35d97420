//! Static port mappings applied at startup.
//!
//! File format:
//!
//! ```json
//! [{"external_port": 61001, "backends": [{"host": "10.0.0.5", "port": 8080}]}]
//! ```

use std::{fs, path::Path};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::proxy::{ControlCommand, Endpoint, RouterHandle};

#[derive(Debug, Deserialize)]
struct MappingEntry {
    external_port: u16,
    #[serde(default)]
    backends: Vec<BackendEntry>,
}

#[derive(Debug, Deserialize)]
struct BackendEntry {
    host: String,
    port: u16,
}

/// Parse a mappings document into the commands that recreate it.
pub fn parse_mappings(raw: &str) -> Result<Vec<ControlCommand>> {
    let entries: Vec<MappingEntry> =
        serde_json::from_str(raw).context("Invalid mappings JSON")?;

    let mut commands = Vec::new();
    for entry in entries {
        let port = entry.external_port;
        if port == 0 {
            bail!("external_port must be non-zero");
        }

        commands.push(ControlCommand::AddPort(port));
        for backend in entry.backends {
            if backend.port == 0 || backend.host.trim().is_empty() {
                bail!("Invalid backend for external_port {port}: host and port are required");
            }
            commands.push(ControlCommand::AttachBackend {
                port,
                endpoint: Endpoint::new(backend.host.trim(), backend.port),
            });
        }
    }

    Ok(commands)
}

/// Read `path` and apply every mapping through `router`.
///
/// Bind failures are not fatal: the router keeps retrying them.
pub async fn apply_mappings_file(path: &Path, router: &RouterHandle) -> Result<usize> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read mappings file {}", path.display()))?;
    let commands = parse_mappings(&raw)
        .with_context(|| format!("Invalid mappings file {}", path.display()))?;

    let count = commands.len();
    for command in commands {
        let port = command.port();
        match router.apply(command).await {
            Ok(()) => {}
            Err(crate::RouterError::ListenerBind { .. }) => {
                info!(port, "Listener bind pending; router will retry");
            }
            Err(e) => return Err(e).context("Failed to apply static mapping"),
        }
    }

    info!(path = %path.display(), commands = count, "Static mappings applied");
    Ok(count)
}
