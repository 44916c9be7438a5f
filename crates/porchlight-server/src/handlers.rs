//! Connection handlers for the Porchlight server.
//!
//! This module wires the router, coordinator, health tracker and transport
//! together and handles the connection lifecycle.

use crate::config::Config;
use crate::coordinator::{Coordinator, CoordinatorSettings};
use crate::fleet::FleetRegistry;
use crate::health::{self, HealthApi, HealthSettings, HealthTracker};
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::session::Session;
use crate::snapshot::{self, FileSnapshotWriter};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use porchlight_core::{Router, RouterConfig};
use porchlight_transport::{
    Connection, ConnectionConfig, StaticCredentials, TcpConfig, TcpTransport, Transport,
    TransportError,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept, so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

struct SessionHandle {
    connection_id: String,
    takeover: Arc<Notify>,
}

/// Shared server state.
pub struct AppState {
    /// The topic router.
    pub router: Arc<Router>,
    /// Server configuration.
    pub config: Config,
    /// Live sessions by client ID.
    sessions: DashMap<String, SessionHandle>,
    /// Accepted connections, authenticated or not.
    active: AtomicUsize,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(router: Arc<Router>, config: Config) -> Self {
        Self {
            router,
            config,
            sessions: DashMap::new(),
            active: AtomicUsize::new(0),
        }
    }

    /// Make `connection_id` the owner of `client_id`.
    ///
    /// A session already holding the client ID is told to close. Returns the
    /// signal the new session listens on for its own takeover.
    fn claim_client_id(&self, client_id: &str, connection_id: &str) -> Arc<Notify> {
        let takeover = Arc::new(Notify::new());
        let previous = self.sessions.insert(
            client_id.to_string(),
            SessionHandle {
                connection_id: connection_id.to_string(),
                takeover: takeover.clone(),
            },
        );

        if let Some(previous) = previous {
            info!(
                client = %client_id,
                connection = %connection_id,
                previous = %previous.connection_id,
                "Client ID reconnected, closing previous session"
            );
            metrics::record_takeover();
            previous.takeover.notify_one();
        }

        takeover
    }

    /// Drop the client ID claim, unless a newer connection owns it.
    fn release_client_id(&self, client_id: &str, connection_id: &str) {
        self.sessions
            .remove_if(client_id, |_, handle| handle.connection_id == connection_id);
    }
}

/// A connection slot counted against `limits.max_connections`.
struct ConnectionSlot {
    state: Arc<AppState>,
}

impl ConnectionSlot {
    fn acquire(state: &Arc<AppState>) -> Option<Self> {
        let limit = state.config.limits.max_connections;
        state
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .ok()?;
        Some(Self {
            state: state.clone(),
        })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.state.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A started server.
///
/// Dropping it stops every background task.
pub struct RunningServer {
    mqtt_addr: SocketAddr,
    health_addr: Option<SocketAddr>,
    state: Arc<AppState>,
    accept_task: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningServer {
    /// Address the MQTT listener is bound to.
    #[must_use]
    pub fn mqtt_addr(&self) -> SocketAddr {
        self.mqtt_addr
    }

    /// Address the health endpoint is bound to, if enabled.
    #[must_use]
    pub fn health_addr(&self) -> Option<SocketAddr> {
        self.health_addr
    }

    /// Shared state.
    #[must_use]
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Wait for the accept loop to end.
    ///
    /// # Errors
    ///
    /// The accept loop only ends by failing, so this always returns an error.
    pub async fn wait(&mut self) -> Result<()> {
        match (&mut self.accept_task).await {
            Ok(()) => Err(anyhow!("MQTT accept loop exited")),
            Err(e) => Err(anyhow!(e).context("MQTT accept loop failed")),
        }
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Start the broker, coordinator, health endpoint and metrics exporter.
///
/// # Errors
///
/// Returns an error if a listener cannot be bound.
pub async fn start(config: Config) -> Result<RunningServer> {
    let started_at = Utc::now();

    if config.uses_default_credentials() {
        warn!("Using the built-in client credentials; set [auth] in the configuration");
    }

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let router = Arc::new(Router::with_config(RouterConfig {
        max_topics: config.limits.max_topics,
        max_subscriptions_per_connection: config.limits.max_subscriptions_per_connection,
    }));

    // Listeners are registered before any client can connect.
    let coordinator_events = router.listen();
    let health_events = router.listen();

    let snapshot_path = config.cooldown.snapshot_path.clone();
    match snapshot::read_snapshot(&snapshot_path).await {
        Ok(Some(previous)) => info!(
            path = %snapshot_path.display(),
            in_cooldown = previous.in_cooldown,
            started_at = %previous.started_at,
            "Found cooldown snapshot from previous run; starting with no cooldown"
        ),
        Ok(None) => debug!(path = %snapshot_path.display(), "No previous cooldown snapshot"),
        Err(e) => warn!(error = %e, "Ignoring unreadable cooldown snapshot"),
    }

    let mut tasks = Vec::new();

    let (snapshots, writer_task) = FileSnapshotWriter::spawn(snapshot_path);
    tasks.push(writer_task);

    let coordinator = Coordinator::new(
        CoordinatorSettings::from(&config),
        router.clone(),
        Arc::new(snapshots),
    );
    tasks.push(tokio::spawn(coordinator.run(coordinator_events)));

    let health_settings = Arc::new(HealthSettings::from_config(&config, started_at));
    let fleet = FleetRegistry::new(
        config.fleet.client_prefix.clone(),
        config.fleet.required,
        started_at,
    );
    let (tracker, health_inputs) = HealthTracker::new(health_settings.clone(), fleet);
    tasks.push(tokio::spawn(tracker.run(health_events)));

    let health_addr = if config.health.enabled {
        let addr = config.health_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind health endpoint on {}", addr))?;
        let local = listener.local_addr()?;
        let app = health::router(HealthApi::new(health_inputs, health_settings));

        tasks.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "Health endpoint stopped");
            }
        }));
        info!("Health endpoint listening on http://{}/health", local);
        Some(local)
    } else {
        None
    };

    let transport = TcpTransport::new(
        TcpConfig {
            bind_addr: config.bind_addr()?,
            connection: ConnectionConfig {
                max_packet_size: config.limits.max_packet_size,
                handshake_timeout: config.limits.handshake_timeout(),
            },
        },
        Arc::new(StaticCredentials::new(
            config.auth.username.clone(),
            config.auth.password.clone(),
        )),
    )
    .await
    .context("Failed to bind MQTT listener")?;
    let mqtt_addr = transport
        .local_addr()
        .context("MQTT listener has no local address")?;

    let state = Arc::new(AppState::new(router, config));
    let accept_task = tokio::spawn(accept_loop(transport, state.clone()));

    info!("Porchlight broker listening on {}", mqtt_addr);

    Ok(RunningServer {
        mqtt_addr,
        health_addr,
        state,
        accept_task,
        tasks,
    })
}

/// Accept connections until the transport fails.
async fn accept_loop<T: Transport + 'static>(transport: T, state: Arc<AppState>) {
    info!(transport = transport.name(), "Accepting connections");

    loop {
        let conn = match transport.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
                metrics::record_error("accept");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let Some(slot) = ConnectionSlot::acquire(&state) else {
            warn!(
                remote = ?conn.remote_addr(),
                limit = state.config.limits.max_connections,
                "Connection limit reached, dropping connection"
            );
            metrics::record_error("connection_limit");
            continue;
        };

        let state = state.clone();
        tokio::spawn(async move {
            let _slot = slot;
            handle_connection(conn, state).await;
        });
    }
}

/// Handle one connection from handshake to cleanup.
async fn handle_connection(mut conn: Box<dyn Connection>, state: Arc<AppState>) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = conn.id().to_string();
    let remote = conn.remote_addr();

    let client = match conn.handshake().await {
        Ok(client) => client,
        Err(TransportError::AuthenticationFailed(_)) => {
            metrics::record_auth_failure();
            return;
        }
        Err(e) => {
            debug!(connection = %connection_id, remote = ?remote, error = %e, "Handshake failed");
            metrics::record_error("handshake");
            return;
        }
    };

    info!(
        connection = %connection_id,
        client = %client.client_id,
        remote = ?remote,
        keep_alive_secs = client.keep_alive.as_secs(),
        "Client connected"
    );

    let client_id = client.client_id.clone();
    let takeover = state.claim_client_id(&client_id, &connection_id);

    let (outbox, deliveries) = mpsc::unbounded_channel();
    state.router.register(&connection_id, &client_id, outbox);

    let mut session = Session::new(conn, client, state.clone(), deliveries, takeover);
    let reason = session.run().await;
    session.close().await;

    state.router.deregister(&connection_id);
    state.release_client_id(&client_id, &connection_id);
    metrics::set_router_stats(&state.router.stats());

    info!(connection = %connection_id, client = %client_id, reason, "Client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use porchlight_protocol::{decode_payload, NotifySignal};
    use rumqttc::{
        AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet,
        QoS,
    };
    use std::path::PathBuf;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config(name: &str) -> (Config, PathBuf) {
        let snapshot_path = std::env::temp_dir().join(format!(
            "porchlight-e2e-{}-{}.json",
            name,
            std::process::id()
        ));
        let mut config = Config::default();
        config.host = "127.0.0.1".to_string();
        config.port = 0;
        config.health.enabled = false;
        config.metrics.enabled = false;
        config.cooldown.duration_secs = 1;
        config.cooldown.snapshot_path = snapshot_path.clone();
        (config, snapshot_path)
    }

    fn client(addr: SocketAddr, client_id: &str, password: &str) -> (AsyncClient, EventLoop) {
        let mut options = MqttOptions::new(client_id, addr.ip().to_string(), addr.port());
        options.set_credentials("user", password);
        options.set_keep_alive(Duration::from_secs(5));
        AsyncClient::new(options, 10)
    }

    /// Drive an event loop and forward incoming publishes.
    fn spawn_poller(mut eventloop: EventLoop) -> mpsc::UnboundedReceiver<rumqttc::Publish> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if tx.send(publish).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        });
        rx
    }

    /// Wait until the notify topic carries `expected`.
    async fn expect_flashing(rx: &mut mpsc::UnboundedReceiver<rumqttc::Publish>, expected: bool) {
        let result = timeout(WAIT, async {
            while let Some(publish) = rx.recv().await {
                if publish.topic != "led_flashing" {
                    continue;
                }
                let signal: NotifySignal = decode_payload(&publish.payload).unwrap();
                if signal.flashing == expected {
                    return;
                }
            }
            panic!("subscriber event loop ended");
        })
        .await;
        assert!(result.is_ok(), "timed out waiting for flashing={}", expected);
    }

    async fn wait_for_snapshot(path: &PathBuf, in_cooldown: bool) {
        let result = timeout(WAIT, async {
            loop {
                if let Ok(Some(snapshot)) = snapshot::read_snapshot(path).await {
                    if snapshot.in_cooldown == in_cooldown {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(result.is_ok(), "snapshot never showed inCooldown={}", in_cooldown);
    }

    #[tokio::test]
    async fn test_notification_cycle() {
        let (config, snapshot_path) = test_config("cycle");
        let server = start(config).await.unwrap();
        let addr = server.mqtt_addr();

        let (button, eventloop) = client(addr, "ESP8266-Button-e2e", "pass");
        let mut notifications = spawn_poller(eventloop);
        button
            .subscribe("led_flashing", QoS::AtLeastOnce)
            .await
            .unwrap();
        expect_flashing(&mut notifications, false).await;

        let (capture, eventloop) = client(addr, "capture", "pass");
        let _capture_rx = spawn_poller(eventloop);
        capture
            .publish(
                "package_exists",
                QoS::AtLeastOnce,
                false,
                r#"{"present":true,"timestamp":"2024-03-09T17:05:42Z"}"#,
            )
            .await
            .unwrap();
        expect_flashing(&mut notifications, true).await;

        button
            .publish(
                "user_handled",
                QoS::AtMostOnce,
                false,
                r#"{"handled":true,"timestamp":123456}"#,
            )
            .await
            .unwrap();
        expect_flashing(&mut notifications, false).await;
        wait_for_snapshot(&snapshot_path, true).await;

        // The one second cooldown elapses with the package still there.
        expect_flashing(&mut notifications, true).await;
        wait_for_snapshot(&snapshot_path, false).await;

        tokio::fs::remove_file(&snapshot_path).await.ok();
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_retained_signal() {
        let (config, snapshot_path) = test_config("retained");
        let server = start(config).await.unwrap();
        let addr = server.mqtt_addr();

        let (capture, eventloop) = client(addr, "capture", "pass");
        let _capture_rx = spawn_poller(eventloop);
        capture
            .publish(
                "package_exists",
                QoS::AtLeastOnce,
                false,
                r#"{"present":true}"#,
            )
            .await
            .unwrap();

        // Wait until the coordinator has republished.
        let router = server.state().router.clone();
        let retained = timeout(WAIT, async {
            loop {
                if let Some(message) = router.retained("led_flashing") {
                    let signal: NotifySignal = decode_payload(&message.payload).unwrap();
                    if signal.flashing {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(retained.is_ok());

        let (button, eventloop) = client(addr, "ESP8266-Button-late", "pass");
        let mut notifications = spawn_poller(eventloop);
        button
            .subscribe("led_flashing", QoS::AtLeastOnce)
            .await
            .unwrap();

        let first = timeout(WAIT, notifications.recv()).await.unwrap().unwrap();
        assert!(first.retain);
        let signal: NotifySignal = decode_payload(&first.payload).unwrap();
        assert!(signal.flashing);

        tokio::fs::remove_file(&snapshot_path).await.ok();
    }

    #[tokio::test]
    async fn test_bad_credentials_are_refused() {
        let (config, _) = test_config("auth");
        let server = start(config).await.unwrap();

        let (_client, mut eventloop) = client(server.mqtt_addr(), "ESP8266-Button-x", "wrong");
        let result = timeout(WAIT, eventloop.poll()).await.unwrap();

        match result {
            Err(ConnectionError::ConnectionRefused(code)) => {
                assert_eq!(code, ConnectReturnCode::BadUserNamePassword);
            }
            other => panic!("expected refusal, got {:?}", other),
        }
        assert_eq!(server.state().router.stats().connection_count, 0);
    }

    #[tokio::test]
    async fn test_same_client_id_takes_over() {
        let (config, _) = test_config("takeover");
        let server = start(config).await.unwrap();
        let addr = server.mqtt_addr();

        let (_first, mut first_loop) = client(addr, "ESP8266-Button-dup", "pass");
        let connack = timeout(WAIT, first_loop.poll()).await.unwrap().unwrap();
        assert!(matches!(connack, Event::Incoming(Packet::ConnAck(_))));

        let (_second, second_loop) = client(addr, "ESP8266-Button-dup", "pass");
        let _second_rx = spawn_poller(second_loop);

        // The first connection is closed by the broker.
        let closed = timeout(WAIT, async {
            loop {
                if first_loop.poll().await.is_err() {
                    return;
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "first session was not closed");
        assert!(server.state().sessions.contains_key("ESP8266-Button-dup"));
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let (mut config, _) = test_config("limit");
        config.limits.max_connections = 1;
        let server = start(config).await.unwrap();
        let addr = server.mqtt_addr();

        let (_first, mut first_loop) = client(addr, "ESP8266-Button-1", "pass");
        let connack = timeout(WAIT, first_loop.poll()).await.unwrap().unwrap();
        assert!(matches!(connack, Event::Incoming(Packet::ConnAck(_))));

        let (_second, mut second_loop) = client(addr, "ESP8266-Button-2", "pass");
        let result = timeout(WAIT, second_loop.poll()).await.unwrap();
        assert!(result.is_err(), "second connection should be dropped");
    }
}
