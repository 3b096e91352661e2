//! Connection lifecycle controller.
//!
//! [`AgentClient`] picks a transport from [`ClientConfig`], runs the `ping`
//! handshake, wires server-initiated requests to the [`SessionRegistry`],
//! and tears everything down again.
//!
//! # Lifecycle
//!
//! 1. [`AgentClient::connect`] → `Connecting`; spawn or dial the agent.
//! 2. Start the receive loop, send `ping`, compare `protocolVersion` with
//!    [`PROTOCOL_VERSION`] → `Connected`, or `Error` on any failure.
//! 3. If the receive loop dies while `Connected` (agent crash, socket
//!    drop) a watcher moves the state to `Error`.
//! 4. [`AgentClient::stop`] sends `session.destroy` for every session, then
//!    closes the transport → `Disconnected`.
//!    [`AgentClient::force_stop`] skips the per-session teardown.
//!    Either one during step 2 aborts the handshake and `connect` fails.

mod state;

pub use state::ConnectionState;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{ClientConfig, TransportKind};
use crate::rpc::client::RpcClient;
use crate::session::{self, SessionHandler, SessionRegistry, SESSION_DESTROY};
use crate::transport::process::{ProcessTransport, SpawnConfig};
use crate::transport::socket::SocketTransport;
use crate::transport::Transport;
use crate::{AppError, Result};

/// Protocol version this client speaks; the agent must report the same.
pub const PROTOCOL_VERSION: u32 = 2;

/// Deadline for each `session.destroy` request during [`AgentClient::stop`].
pub const SESSION_DESTROY_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the notification broadcast channel.
const NOTIFICATION_CAPACITY: usize = 256;

/// Result of the `ping` method.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    /// Echo of the ping message.
    #[serde(default)]
    pub message: String,
    /// Server clock in milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
    /// Protocol version the server speaks.
    #[serde(default)]
    pub protocol_version: Option<u64>,
}

/// A notification from the agent, as seen by subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerNotification {
    /// Method name.
    pub method: String,
    /// Parameters, if any.
    pub params: Option<Value>,
}

/// Everything owned by one live connection.
struct ActiveConnection {
    epoch: u64,
    rpc: RpcClient,
    transport: Arc<dyn Transport>,
    receive_loop: JoinHandle<()>,
    notification_pump: JoinHandle<()>,
    watcher: Option<JoinHandle<()>>,
}

/// Client for one agent process or server.
pub struct AgentClient {
    config: ClientConfig,
    sessions: SessionRegistry,
    state: Arc<watch::Sender<ConnectionState>>,
    notifications: broadcast::Sender<ServerNotification>,
    connection: Mutex<Option<ActiveConnection>>,
    next_epoch: AtomicU64,
}

impl std::fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClient")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl AgentClient {
    /// Create a disconnected client.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `config` fails validation.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Ok(Self {
            config,
            sessions: SessionRegistry::new(),
            state: Arc::new(state),
            notifications,
            connection: Mutex::new(None),
            next_epoch: AtomicU64::new(0),
        })
    }

    /// Configuration this client was built with.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Receive every notification sent by the agent.
    #[must_use]
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<ServerNotification> {
        self.notifications.subscribe()
    }

    /// Registry consulted for server-initiated requests.
    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Register a session so it receives requests addressed to its id.
    pub async fn register_session(&self, handler: Arc<dyn SessionHandler>) {
        self.sessions.register(handler).await;
    }

    /// Connect using the transport selected by the configuration.
    ///
    /// # Errors
    ///
    /// - [`AppError::InvalidState`] if already connecting or connected.
    /// - Transport errors from spawning or dialling the agent.
    /// - [`AppError::VersionMismatch`] if the agent speaks another protocol
    ///   version.
    ///
    /// Every error except `InvalidState` leaves the client in `Error`, unless
    /// [`stop`](Self::stop) or [`force_stop`](Self::force_stop) ran while
    /// connecting; then connect fails with [`AppError::ConnectionClosed`] and
    /// the client stays `Disconnected`.
    pub async fn connect(&self) -> Result<()> {
        self.begin_connecting().await?;

        let transport = match self.open_transport().await {
            Ok(transport) => transport,
            Err(e) => {
                warn!(error = %e, "connection: failed to open transport");
                self.transition(ConnectionState::Connecting, ConnectionState::Error);
                return Err(e);
            }
        };

        self.finish_connect(transport).await
    }

    /// Connect over a caller-supplied transport instead of the configured one.
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Self::connect), minus transport-opening errors.
    pub async fn connect_with_transport(&self, transport: Arc<dyn Transport>) -> Result<()> {
        self.begin_connecting().await?;
        self.finish_connect(transport).await
    }

    /// Send `ping` and return the agent's reply.
    ///
    /// # Errors
    ///
    /// [`AppError::NotConnected`] unless connected, plus any request error.
    pub async fn ping(&self, message: Option<&str>) -> Result<PingResponse> {
        let rpc = self.connected_rpc().await?;
        ping_with(&rpc, message).await
    }

    /// Send a request to the agent and wait for the result.
    ///
    /// # Errors
    ///
    /// [`AppError::NotConnected`] unless connected, plus any error from
    /// [`RpcClient::send_request`].
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let rpc = self.connected_rpc().await?;
        rpc.send_request(method, params).await
    }

    /// Send a notification to the agent.
    ///
    /// # Errors
    ///
    /// [`AppError::NotConnected`] unless connected, plus any transport error.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let rpc = self.connected_rpc().await?;
        rpc.send_notification(method, params).await
    }

    /// Tear down every session, then close the connection.
    ///
    /// Each registered session gets a `session.destroy` request; failures are
    /// collected and returned rather than aborting the shutdown.
    ///
    /// Always ends in `Disconnected`; the returned vector lists the teardown
    /// errors encountered on the way.
    pub async fn stop(&self) -> Vec<AppError> {
        let span = info_span!("connection_stop");
        async move {
            let mut errors = Vec::new();
            let Some(mut conn) = self.connection.lock().await.take() else {
                self.sessions.drain().await;
                self.set_state(ConnectionState::Disconnected);
                return errors;
            };

            if let Some(watcher) = conn.watcher.take() {
                watcher.abort();
            }

            for session in self.sessions.drain().await {
                let session_id = session.session_id().to_owned();
                let destroyed = conn
                    .rpc
                    .send_request_with_timeout(
                        SESSION_DESTROY,
                        Some(json!({ "sessionId": session_id })),
                        Some(SESSION_DESTROY_TIMEOUT),
                    )
                    .await;
                if let Err(e) = destroyed {
                    warn!(%session_id, error = %e, "connection: session teardown failed");
                    errors.push(e);
                }
            }

            if let Err(e) = close_connection(conn).await {
                errors.push(e);
            }

            self.set_state(ConnectionState::Disconnected);
            info!(errors = errors.len(), "connection: stopped");
            errors
        }
        .instrument(span)
        .await
    }

    /// Close the connection immediately, skipping per-session teardown.
    pub async fn force_stop(&self) {
        let conn = self.connection.lock().await.take();
        self.sessions.drain().await;

        if let Some(mut conn) = conn {
            if let Some(watcher) = conn.watcher.take() {
                watcher.abort();
            }
            if let Err(e) = close_connection(conn).await {
                warn!(error = %e, "connection: error during forced stop");
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("connection: force stopped");
    }

    // ── Private helpers ──────────────────────────────────────────────────────

    /// Move to `Connecting`, discarding a connection left over from `Error`.
    async fn begin_connecting(&self) -> Result<()> {
        let mut refused = None;
        self.state.send_if_modified(|state| {
            if state.can_connect() {
                *state = ConnectionState::Connecting;
                true
            } else {
                refused = Some(*state);
                false
            }
        });
        if let Some(state) = refused {
            return Err(AppError::InvalidState(format!(
                "cannot connect while {state}"
            )));
        }

        let stale = self.connection.lock().await.take();
        if let Some(mut conn) = stale {
            debug!("connection: discarding failed connection before reconnect");
            if let Some(watcher) = conn.watcher.take() {
                watcher.abort();
            }
            if let Err(e) = close_connection(conn).await {
                debug!(error = %e, "connection: error closing stale transport");
            }
        }
        Ok(())
    }

    async fn open_transport(&self) -> Result<Arc<dyn Transport>> {
        match self.config.transport_kind()? {
            TransportKind::Socket { host, port } => {
                let transport =
                    SocketTransport::connect_to(&host, port, self.config.connect_timeout())
                        .await?;
                Ok(Arc::new(transport))
            }
            TransportKind::Process => {
                let transport = ProcessTransport::spawn(&SpawnConfig::from_config(&self.config))?;
                Ok(Arc::new(transport))
            }
        }
    }

    async fn finish_connect(&self, transport: Arc<dyn Transport>) -> Result<()> {
        let rpc = RpcClient::with_request_timeout(
            Arc::clone(&transport),
            self.config.request_timeout(),
        );

        let registry = self.sessions.clone();
        rpc.set_request_handler(move |_id, method, params| {
            let registry = registry.clone();
            async move { session::route_request(&registry, &method, params).await }
        });

        let (note_tx, note_rx) = mpsc::unbounded_channel();
        rpc.set_notification_handler(move |method, params| {
            // The pump only stops once the connection is being dropped.
            let _ = note_tx.send(ServerNotification { method, params });
        });
        let notification_pump =
            spawn_notification_pump(note_rx, self.sessions.clone(), self.notifications.clone());

        let receive_loop = match rpc.start() {
            Ok(handle) => handle,
            Err(e) => {
                notification_pump.abort();
                if let Err(close_err) = transport.close().await {
                    debug!(error = %close_err, "connection: error closing transport");
                }
                self.transition(ConnectionState::Connecting, ConnectionState::Error);
                return Err(e);
            }
        };

        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let conn = ActiveConnection {
            epoch,
            rpc: rpc.clone(),
            transport,
            receive_loop,
            notification_pump,
            watcher: None,
        };

        // Registered before the handshake so stop/force_stop can abort it.
        {
            let mut slot = self.connection.lock().await;
            if self.state() != ConnectionState::Connecting {
                drop(slot);
                if let Err(e) = close_connection(conn).await {
                    debug!(error = %e, "connection: error closing aborted connection");
                }
                return Err(aborted());
            }
            *slot = Some(conn);
        }

        if let Err(e) = verify_protocol_version(&rpc).await {
            warn!(error = %e, "connection: handshake failed");
            if let Some(conn) = self.take_connection(epoch).await {
                if let Err(close_err) = close_connection(conn).await {
                    debug!(error = %close_err, "connection: error closing after failed handshake");
                }
            }
            self.transition(ConnectionState::Connecting, ConnectionState::Error);
            return Err(e);
        }

        let mut slot = self.connection.lock().await;
        let Some(conn) = slot.as_mut().filter(|conn| conn.epoch == epoch) else {
            return Err(aborted());
        };
        if !self.transition(ConnectionState::Connecting, ConnectionState::Connected) {
            return Err(aborted());
        }
        conn.watcher = Some(spawn_loss_watcher(rpc, Arc::clone(&self.state)));
        drop(slot);

        info!(protocol_version = PROTOCOL_VERSION, "connection: connected");
        Ok(())
    }

    /// Remove the connection from its slot if it is still the one from `epoch`.
    async fn take_connection(&self, epoch: u64) -> Option<ActiveConnection> {
        let mut slot = self.connection.lock().await;
        if slot.as_ref().is_some_and(|conn| conn.epoch == epoch) {
            slot.take()
        } else {
            None
        }
    }

    async fn connected_rpc(&self) -> Result<RpcClient> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(AppError::NotConnected(format!("client is {state}")));
        }
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|conn| conn.rpc.clone())
            .ok_or_else(|| AppError::NotConnected("client has no active connection".into()))
    }

    /// Move `from` to `to`; returns `false` if the state is no longer `from`.
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                debug!(from = %state, to = %to, "connection: state change");
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                debug!(from = %state, to = %next, "connection: state change");
                *state = next;
                true
            }
        });
    }
}

// ── Free helpers ──────────────────────────────────────────────────────────────

fn aborted() -> AppError {
    AppError::ConnectionClosed("connection stopped during handshake".into())
}

async fn ping_with(rpc: &RpcClient, message: Option<&str>) -> Result<PingResponse> {
    let params = message.map(|m| json!({ "message": m }));
    let result = rpc.send_request("ping", params).await?;
    serde_json::from_value(result)
        .map_err(|e| AppError::InvalidResponse(format!("unexpected ping result: {e}")))
}

async fn verify_protocol_version(rpc: &RpcClient) -> Result<()> {
    let pong = ping_with(rpc, None).await?;
    match pong.protocol_version {
        Some(version) if version == u64::from(PROTOCOL_VERSION) => Ok(()),
        actual => Err(AppError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual,
        }),
    }
}

async fn close_connection(conn: ActiveConnection) -> Result<()> {
    conn.rpc.stop();
    let closed = conn.transport.close().await;
    if let Err(e) = conn.receive_loop.await {
        debug!(error = %e, "connection: receive loop task ended abnormally");
    }
    conn.notification_pump.abort();
    closed
}

/// Forward notifications to their session and to broadcast subscribers, in
/// arrival order.
fn spawn_notification_pump(
    mut rx: mpsc::UnboundedReceiver<ServerNotification>,
    sessions: SessionRegistry,
    broadcaster: broadcast::Sender<ServerNotification>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(note) = rx.recv().await {
            session::route_event(&sessions, &note.method, note.params.as_ref()).await;
            // No subscribers is not an error.
            let _ = broadcaster.send(note);
        }
    })
}

/// Move `Connected` to `Error` once the receive loop exits on its own.
fn spawn_loss_watcher(
    rpc: RpcClient,
    state: Arc<watch::Sender<ConnectionState>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        rpc.closed().await;
        let changed = state.send_if_modified(|s| {
            if *s == ConnectionState::Connected {
                *s = ConnectionState::Error;
                true
            } else {
                false
            }
        });
        if changed {
            warn!("connection: lost connection to agent");
        }
    })
}
