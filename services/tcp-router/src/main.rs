//! tcpr TCP router
//!
//! L4 port-to-backends router.
//!
//! This service:
//! - Applies static port mappings from a file at startup
//! - Syncs port mappings from the control plane event feed
//! - Accepts TCP connections on every mapped external port
//! - Relays each connection to a round-robin selected backend
//! - Drains sessions on shutdown, force-closing them after a grace period

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tcpr_router::{bootstrap, config, sync, Router};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to TCPR_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting tcpr router");
    info!(
        bind_addr = %config.bind_addr,
        connect_timeout_ms = config.connect_timeout.as_millis() as u64,
        idle_timeout_ms = config.idle_timeout.map(|d| d.as_millis() as u64),
        max_dial_attempts = config.max_dial_attempts,
        max_connections = config.max_connections,
        drain_grace_ms = config.drain_grace.as_millis() as u64,
        sync_enabled = config.sync.is_some(),
        "Configuration loaded"
    );

    let router = Router::new(config.router_config()).spawn();

    if let Some(path) = &config.mappings_file {
        bootstrap::apply_mappings_file(path, &router)
            .await
            .context("Failed to apply static mappings")?;
    }

    let sync_task = config.sync.clone().map(|sync_config| {
        let router = router.clone();
        tokio::spawn(async move { sync::run_sync_loop(&sync_config, router).await })
    });

    match sync_task {
        Some(mut task) => {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal.context("Failed to listen for shutdown signal")?;
                    info!("Shutdown signal received");
                    task.abort();
                }
                joined = &mut task => match joined {
                    Ok(Ok(cursor)) => {
                        info!(cursor, "Event sync finished; serving until shutdown signal");
                        tokio::signal::ctrl_c()
                            .await
                            .context("Failed to listen for shutdown signal")?;
                    }
                    Ok(Err(e)) => error!(error = %format!("{e:#}"), "Event sync failed"),
                    Err(e) => error!(error = %e, "Event sync task panicked"),
                },
            }
        }
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
        }
    }

    let report = router.shutdown().await.context("Router already stopped")?;
    if report.force_closed > 0 {
        warn!(
            force_closed = report.force_closed,
            "Sessions force-closed at shutdown"
        );
    }
    info!(drained = report.drained, "tcpr router stopped");

    Ok(())
}
