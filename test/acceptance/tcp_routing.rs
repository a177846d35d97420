//! TCP routing acceptance tests.
//!
//! Drives the router the way the platform does: port mappings are published on
//! a control-plane event feed, the router tails the feed, and the tests only
//! observe behaviour through raw TCP sockets.
//!
//! Scenarios:
//!
//! 1. One app mapped to an external port answers through it
//! 2. Two apps mapped to the same port both receive traffic
//! 3. Removing the mapping closes the port
//!
//! ## Running
//!
//! ```bash
//! cargo test -p tcpr-acceptance --test tcp_routing
//! ```

use std::collections::BTreeSet;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router as HttpRouter};
use serde::Deserialize;
use serde_json::{json, Value};
use tcpr_events::{BackendAttachedPayload, MappingEvent, PortAddedPayload, PortRemovedPayload};
use tcpr_router::config::SyncConfig;
use tcpr_router::{sync, Router, RouterConfig, RouterHandle};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

const REQUEST: &str = "Time is 123456789";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tcpr_router=debug")
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    after_event_id: i64,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    200
}

/// In-memory stand-in for the control plane's TCP route event feed.
#[derive(Clone, Default)]
struct ControlPlane {
    events: Arc<RwLock<Vec<Value>>>,
}

impl ControlPlane {
    async fn spawn(&self) -> String {
        let app = HttpRouter::new()
            .route("/v1/tcp-routes/events", get(list_events))
            .with_state(self.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn publish(&self, event: MappingEvent) {
        let payload = event.payload().unwrap();
        let mut events = self.events.write().await;
        let event_id = events.len() as i64 + 1;
        events.push(json!({
            "event_id": event_id,
            "event_type": event.event_type(),
            "payload": payload,
        }));
    }

    async fn map_port(&self, port: u16) {
        self.publish(MappingEvent::PortAdded(PortAddedPayload {
            external_port: port,
        }))
        .await;
    }

    async fn unmap_port(&self, port: u16) {
        self.publish(MappingEvent::PortRemoved(PortRemovedPayload {
            external_port: port,
        }))
        .await;
    }

    async fn attach(&self, port: u16, app: &App) {
        self.publish(MappingEvent::BackendAttached(BackendAttachedPayload {
            external_port: port,
            host: app.addr.ip().to_string(),
            port: app.addr.port(),
            instance_id: Some(app.server_id.clone()),
        }))
        .await;
    }
}

async fn list_events(State(cp): State<ControlPlane>, Query(q): Query<EventsQuery>) -> Json<Value> {
    let events = cp.events.read().await;
    let items: Vec<Value> = events
        .iter()
        .skip(q.after_event_id.max(0) as usize)
        .take(q.limit)
        .cloned()
        .collect();
    let next = q.after_event_id + items.len() as i64;
    Json(json!({ "items": items, "next_after_event_id": next }))
}

/// An app instance: answers one request with `"{server_id}:{request}"`.
struct App {
    addr: SocketAddr,
    server_id: String,
    task: JoinHandle<()>,
}

impl App {
    async fn push(server_id: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let prefix = format!("{server_id}:");

        let task = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let prefix = prefix.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    if let Ok(n) = stream.read(&mut buf).await {
                        let mut response = prefix.into_bytes();
                        response.extend_from_slice(&buf[..n]);
                        let _ = stream.write_all(&response).await;
                    }
                });
            }
        });

        Self {
            addr,
            server_id: server_id.to_string(),
            task,
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Platform {
    control_plane: ControlPlane,
    router: RouterHandle,
    sync_task: JoinHandle<()>,
}

impl Platform {
    async fn start() -> Self {
        init_tracing();

        let control_plane = ControlPlane::default();
        let url = control_plane.spawn().await;

        let router = Router::new(RouterConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            drain_grace: Duration::from_millis(500),
            ..RouterConfig::default()
        })
        .spawn();

        let sync_config = SyncConfig {
            control_plane_url: url,
            control_plane_token: None,
            fetch_limit: 200,
            poll_interval: Duration::from_millis(50),
            once: false,
        };
        let sync_router = router.clone();
        let sync_task = tokio::spawn(async move {
            if let Err(e) = sync::run_sync_loop(&sync_config, sync_router).await {
                tracing::error!(error = %format!("{e:#}"), "sync loop failed");
            }
        });

        Self {
            control_plane,
            router,
            sync_task,
        }
    }

    async fn wait_listening(&self, port: u16, listening: bool) {
        let router = &self.router;
        eventually(move || async move {
            let ports = router.listening_ports().await.unwrap();
            ports.iter().any(|(p, _)| *p == port) == listening
        })
        .await;
    }

    async fn wait_backends(&self, port: u16, count: usize) {
        let table = self.router.table();
        let table = &table;
        eventually(move || async move { table.snapshot(port).len() == count }).await;
    }

    async fn stop(self) {
        self.sync_task.abort();
        let _ = self.router.shutdown().await;
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached within 5s");
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn get_server_response(port: u16) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(REQUEST.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("response timed out")
        .unwrap();
    String::from_utf8(response).unwrap()
}

fn server_id_of(response: &str) -> &str {
    response.split(':').next().unwrap_or_default()
}

#[tokio::test]
async fn maps_external_port_to_app_container_port() {
    let platform = Platform::start().await;
    let app = App::push("app-1").await;
    let port = free_port().await;

    platform.control_plane.map_port(port).await;
    platform.control_plane.attach(port, &app).await;
    platform.wait_listening(port, true).await;
    platform.wait_backends(port, 1).await;

    let response = get_server_response(port).await;
    assert!(response.contains(&app.server_id), "{response}");
    assert_eq!(server_id_of(&response), app.server_id);
    assert_eq!(response, format!("app-1:{REQUEST}"));

    platform.stop().await;
}

#[tokio::test]
async fn single_app_receives_every_connection() {
    let platform = Platform::start().await;
    let app = App::push("only").await;
    let port = free_port().await;

    platform.control_plane.attach(port, &app).await;
    platform.wait_backends(port, 1).await;
    platform.wait_listening(port, true).await;

    for _ in 0..10 {
        let response = get_server_response(port).await;
        assert_eq!(server_id_of(&response), "only");
    }

    platform.stop().await;
}

#[tokio::test]
async fn two_apps_on_one_port_share_connections() {
    let platform = Platform::start().await;
    let app1 = App::push("app-1").await;
    let app2 = App::push("app-2").await;
    let port = free_port().await;

    platform.control_plane.map_port(port).await;
    platform.control_plane.attach(port, &app1).await;
    platform.control_plane.attach(port, &app2).await;
    platform.wait_listening(port, true).await;
    platform.wait_backends(port, 2).await;

    let first = get_server_response(port).await;
    let second = get_server_response(port).await;

    let seen: BTreeSet<String> = [first, second]
        .iter()
        .map(|r| server_id_of(r).to_string())
        .collect();
    let expected: BTreeSet<String> = [app1.server_id.clone(), app2.server_id.clone()]
        .into_iter()
        .collect();
    assert_eq!(seen, expected);

    platform.stop().await;
}

#[tokio::test]
async fn unmapped_port_refuses_connections() {
    let platform = Platform::start().await;
    let app = App::push("app-1").await;
    let port = free_port().await;

    platform.control_plane.attach(port, &app).await;
    platform.wait_listening(port, true).await;
    platform.wait_backends(port, 1).await;
    assert_eq!(server_id_of(&get_server_response(port).await), "app-1");

    platform.control_plane.unmap_port(port).await;
    platform.wait_listening(port, false).await;

    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

    platform.stop().await;
}
