use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code},
    },
    response::IntoResponse,
    routing::get,
};
use fastchat_core::{
    CLOSE_TIMEOUT, CONNECTION_QUEUE_DEPTH, DEFAULT_BIND_ADDRESS, Envelope, Frame, HISTORY_MAX,
    HistoryStore, KEEPALIVE_INTERVAL, KEEPALIVE_TIMEOUT, MAX_MESSAGE_BYTES, decode_frame,
    default_history_path, encode_frame, write_history_file,
};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    net::TcpListener,
    sync::{Mutex, mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, error, info, warn};

pub mod registry;

pub use registry::{BroadcastReport, ConnectionId, ConnectionRegistry};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_address: String,
    /// `None` keeps history in memory only.
    pub history_path: Option<PathBuf>,
    pub history_max: usize,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub queue_depth: usize,
    pub close_timeout: Duration,
    pub max_message_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_owned(),
            history_path: Some(default_history_path()),
            history_max: HISTORY_MAX,
            keepalive_interval: KEEPALIVE_INTERVAL,
            keepalive_timeout: KEEPALIVE_TIMEOUT,
            queue_depth: CONNECTION_QUEUE_DEPTH,
            close_timeout: CLOSE_TIMEOUT,
            max_message_bytes: MAX_MESSAGE_BYTES,
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind {address}: {source}")]
    Start {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy)]
struct ConnectionLimits {
    queue_depth: usize,
    keepalive_interval: Duration,
    keepalive_timeout: Duration,
    max_message_bytes: usize,
}

impl From<&RelayConfig> for ConnectionLimits {
    fn from(config: &RelayConfig) -> Self {
        Self {
            queue_depth: config.queue_depth.max(1),
            keepalive_interval: config.keepalive_interval,
            keepalive_timeout: config.keepalive_timeout,
            max_message_bytes: config.max_message_bytes,
        }
    }
}

/// Mirrors history snapshots to disk on the blocking pool. Writes are
/// serialized, and a snapshot older than the last one written is skipped.
#[derive(Debug)]
struct HistoryWriter {
    path: PathBuf,
    written: Mutex<u64>,
}

impl HistoryWriter {
    fn new(path: PathBuf, revision: u64) -> Self {
        Self {
            path,
            written: Mutex::new(revision),
        }
    }

    async fn write(&self, revision: u64, items: Vec<Envelope>) {
        let mut written = self.written.lock().await;
        if *written >= revision {
            return;
        }

        let path = self.path.clone();
        match tokio::task::spawn_blocking(move || write_history_file(&path, &items)).await {
            Ok(Ok(())) => *written = revision,
            Ok(Err(err)) => warn!(path = ?self.path, "failed to persist history: {err}"),
            Err(err) => error!("history write task failed: {err}"),
        }
    }
}

/// State shared by every connection handler of one relay instance.
#[derive(Debug, Clone)]
pub struct AppState {
    registry: ConnectionRegistry,
    history: Arc<Mutex<HistoryStore>>,
    writer: Option<Arc<HistoryWriter>>,
    limits: ConnectionLimits,
}

impl AppState {
    fn new(history: HistoryStore, limits: ConnectionLimits, send_timeout: Duration) -> Self {
        let writer = history
            .path()
            .map(|path| Arc::new(HistoryWriter::new(path.to_path_buf(), history.revision())));
        Self {
            registry: ConnectionRegistry::new().with_send_timeout(send_timeout),
            history: Arc::new(Mutex::new(history)),
            writer,
            limits,
        }
    }

    /// Registers a new connection. The history replay is queued ahead of
    /// registration while the history lock is held, so the newcomer sees
    /// every message exactly once: either in the replay or live.
    async fn admit(&self, tx: mpsc::Sender<Message>) -> ConnectionId {
        let history = self.history.lock().await;
        let snapshot = history.snapshot();
        if !snapshot.is_empty() {
            match encode_frame(&Frame::History(snapshot)) {
                Ok(frame) => {
                    if let Err(err) = tx.try_send(Message::Text(frame.into())) {
                        warn!("failed to queue history replay: {err}");
                    }
                }
                Err(err) => error!("failed to serialize history replay: {err}"),
            }
        }
        let id = self.registry.register(tx).await;
        drop(history);
        id
    }

    /// Decodes, stores and fans out one inbound text frame. Frames that do
    /// not decode are dropped without affecting the session.
    async fn ingest(&self, from: ConnectionId, text: &str) -> Option<BroadcastReport> {
        let envelope = match decode_frame(text) {
            Ok(Frame::Envelope(envelope)) => envelope,
            Ok(Frame::History(_)) => {
                debug!(connection_id = from, "ignoring history frame from peer");
                return None;
            }
            Err(err) => {
                debug!(connection_id = from, "dropping undecodable frame: {err}");
                return None;
            }
        };

        // Held across the fan-out so broadcasts leave in receipt order.
        let mut history = self.history.lock().await;
        let stored = history.push(envelope.normalized());
        let pending = self
            .writer
            .as_ref()
            .map(|writer| (Arc::clone(writer), history.revision(), history.snapshot()));

        let report = match encode_frame(&Frame::Envelope(stored)) {
            Ok(frame) => Some(
                self.registry
                    .broadcast(Message::Text(frame.into()), Some(from))
                    .await,
            ),
            Err(err) => {
                error!("failed to serialize envelope: {err}");
                None
            }
        };
        drop(history);

        if let Some((writer, revision, items)) = pending {
            writer.write(revision, items).await;
        }
        report
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

async fn healthz_handler(State(state): State<AppState>) -> impl IntoResponse {
    let connections = state.registry.len().await;
    let history = state.history.lock().await.len();
    Json(serde_json::json!({"ok": true, "connections": connections, "history": history}))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let max_bytes = state.limits.max_message_bytes;
    ws.max_message_size(max_bytes)
        .max_frame_size(max_bytes)
        .on_upgrade(move |socket| handle_socket(state, socket, peer))
}

async fn handle_socket(state: AppState, socket: WebSocket, peer: SocketAddr) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(state.limits.queue_depth);

    let connection_id = state.admit(outbound_tx).await;
    info!(connection_id, %peer, "peer connected");

    // The writer owns the socket's send half. It ends once the registry
    // drops this connection's queue, closing the socket on the way out.
    let keepalive = state.limits.keepalive_interval;
    let mut send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(keepalive);
        ping_interval.tick().await; // skip first immediate tick

        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(message) => {
                            if ws_sender.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = ws_sender
                                .send(Message::Close(Some(CloseFrame {
                                    code: close_code::NORMAL,
                                    reason: Utf8Bytes::from_static("closing"),
                                })))
                                .await;
                            break;
                        }
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let idle_limit = state.limits.keepalive_interval + state.limits.keepalive_timeout;
    loop {
        let next = tokio::select! {
            _ = &mut send_task => break,
            next = timeout(idle_limit, ws_receiver.next()) => next,
        };

        let message = match next {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(err))) => {
                warn!(connection_id, "websocket receive error: {err}");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                warn!(connection_id, "no traffic for {:?}, closing", idle_limit);
                break;
            }
        };

        match message {
            Message::Text(text) => {
                state.ingest(connection_id, text.as_str()).await;
            }
            Message::Close(_) => break,
            Message::Binary(_) => debug!(connection_id, "ignoring binary frame"),
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    state.registry.remove(connection_id).await;
    send_task.abort();
    info!(connection_id, %peer, "peer disconnected");
}

#[derive(Debug)]
struct RunningServer {
    local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// A broadcast relay that can be started and stopped repeatedly, either as
/// the whole process or embedded next to a client.
#[derive(Debug)]
pub struct Relay {
    config: RelayConfig,
    state: AppState,
    server: Mutex<Option<RunningServer>>,
}

impl Relay {
    /// Creates a stopped relay and loads its persisted history.
    pub fn new(config: RelayConfig) -> Self {
        let mut history = HistoryStore::with_capacity(config.history_max, config.history_path.clone());
        history.load();
        let state = AppState::new(history, ConnectionLimits::from(&config), config.close_timeout);
        Self {
            config,
            state,
            server: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Binds the listener and starts serving. Calling this while running
    /// returns the current address without rebinding.
    pub async fn start(&self) -> Result<SocketAddr, RelayError> {
        let mut server = self.server.lock().await;
        if let Some(running) = server.as_ref() {
            return Ok(running.local_addr);
        }

        let address = self.config.bind_address.clone();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| RelayError::Start {
                address: address.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| RelayError::Start {
            address: address.clone(),
            source,
        })?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = build_router(self.state.clone()).into_make_service_with_connect_info::<SocketAddr>();
        let serve = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        let task = tokio::spawn(async move {
            if let Err(err) = serve.await {
                warn!("relay server exited: {err}");
            }
        });

        info!("relay listening on ws://{local_addr}");
        *server = Some(RunningServer {
            local_addr,
            shutdown_tx,
            task,
        });
        Ok(local_addr)
    }

    /// Closes the listener and every peer connection. Returns once the
    /// listening socket has been released.
    pub async fn stop(&self) {
        let Some(running) = self.server.lock().await.take() else {
            return;
        };

        let _ = running.shutdown_tx.send(());
        let closed = self.state.registry.clear().await;

        let mut task = running.task;
        if timeout(self.config.close_timeout, &mut task).await.is_err() {
            warn!(
                "relay did not shut down within {:?}, aborting",
                self.config.close_timeout
            );
            task.abort();
            let _ = task.await;
        }
        info!(closed, "relay on {} stopped", running.local_addr);
    }

    pub async fn is_running(&self) -> bool {
        self.server.lock().await.is_some()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().await.as_ref().map(|running| running.local_addr)
    }

    pub async fn connection_count(&self) -> usize {
        self.state.registry.len().await
    }

    pub async fn history_snapshot(&self) -> Vec<Envelope> {
        self.state.history.lock().await.snapshot()
    }
}
