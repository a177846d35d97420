//! Control plane synchronization.
//!
//! Tails the TCP route event feed and forwards every mapping event to the
//! router. The cursor lives in memory only: a restarted router replays the
//! feed from the beginning.

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use tcpr_events::MappingEvent;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::proxy::{ControlCommand, RouterHandle};

#[derive(Debug, Deserialize)]
struct EventsResponse {
    items: Vec<EventItem>,
    next_after_event_id: i64,
}

#[derive(Debug, Deserialize)]
struct EventItem {
    event_id: i64,
    event_type: String,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

fn build_client(config: &SyncConfig) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    if let Some(token) = &config.control_plane_token {
        let raw = token.trim();
        let bearer = if raw.starts_with("Bearer ") || raw.starts_with("bearer ") {
            raw.to_string()
        } else {
            format!("Bearer {raw}")
        };

        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&bearer).context("Invalid control-plane token format")?,
        );
    }

    let client = reqwest::Client::builder()
        .user_agent(concat!("tcpr-router/", env!("CARGO_PKG_VERSION")))
        .default_headers(headers)
        .build()?;
    Ok(client)
}

async fn fetch_events(
    client: &reqwest::Client,
    base_url: &str,
    after_event_id: i64,
    limit: i64,
) -> Result<EventsResponse> {
    let base = base_url.trim_end_matches('/');
    let url = format!("{base}/v1/tcp-routes/events");

    let resp = client
        .get(url)
        .query(&[("after_event_id", after_event_id), ("limit", limit)])
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(anyhow::anyhow!(
            "events query failed (status={}): {}",
            status,
            body
        ));
    }

    Ok(resp.json::<EventsResponse>().await?)
}

/// Decode one feed item; `None` for events the router does not consume.
fn decode_item(item: EventItem) -> Result<Option<MappingEvent>> {
    if !MappingEvent::is_mapping_event(&item.event_type) {
        return Ok(None);
    }

    let Some(payload) = item.payload else {
        warn!(
            event_id = item.event_id,
            event_type = %item.event_type,
            "mapping event missing payload"
        );
        return Ok(None);
    };

    let event = MappingEvent::decode(&item.event_type, payload)
        .with_context(|| format!("invalid event {} ({})", item.event_id, item.event_type))?;
    Ok(Some(event))
}

/// Poll mapping events and forward them to the router.
///
/// Returns the final cursor in `once` mode; otherwise runs until the router
/// stops or an event cannot be decoded.
pub async fn run_sync_loop(config: &SyncConfig, router: RouterHandle) -> Result<i64> {
    let client = build_client(config)?;
    let mut cursor: i64 = 0;
    let mut applied: u64 = 0;

    info!(
        control_plane_url = %config.control_plane_url,
        fetch_limit = config.fetch_limit,
        "Starting event sync"
    );

    loop {
        let resp = fetch_events(
            &client,
            &config.control_plane_url,
            cursor,
            config.fetch_limit,
        )
        .await;

        let resp = match resp {
            Ok(resp) => resp,
            Err(e) => {
                warn!(error = %e, cursor, "failed to fetch events; retrying");
                tokio::time::sleep(config.poll_interval).await;
                continue;
            }
        };

        if resp.items.is_empty() {
            if config.once {
                info!(cursor, applied, "sync complete");
                return Ok(cursor);
            }

            tokio::time::sleep(config.poll_interval).await;
            continue;
        }

        for item in resp.items {
            let event_id = item.event_id;
            cursor = event_id;

            let Some(event) = decode_item(item)? else {
                continue;
            };

            debug!(
                event_id,
                event_type = event.event_type(),
                external_port = event.external_port(),
                "applying mapping event"
            );
            router
                .notify(ControlCommand::from(event))
                .await
                .context("router stopped while syncing")?;
            applied += 1;
        }

        cursor = resp.next_after_event_id.max(cursor);
    }
}
