use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
    time::Duration,
};

use fastchat_core::{
    Attachment, DEFAULT_LOCAL_ENDPOINT, Envelope, Frame, KEEPALIVE_INTERVAL, KEEPALIVE_TIMEOUT,
    decode_frame, encode_frame, timestamp_now,
};
use futures::{Sink, SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    time::{Instant, sleep_until, timeout},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Message, Utf8Bytes,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tracing::{debug, info, warn};

use crate::{
    ClientError,
    backoff::Backoff,
    settings::DEFAULT_USER_NAME,
    transcript::{TRANSCRIPT_MAX, Transcript},
};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(12);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: String,
    pub user_name: String,
    /// Length of one backoff step; delays run 1, 2, 4, 8, 10 steps.
    pub backoff_unit: Duration,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub transcript_max: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_LOCAL_ENDPOINT.to_owned(),
            user_name: DEFAULT_USER_NAME.to_owned(),
            backoff_unit: Duration::from_secs(1),
            connect_timeout: CONNECT_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
            keepalive_timeout: KEEPALIVE_TIMEOUT,
            transcript_max: TRANSCRIPT_MAX,
        }
    }
}

type MessageHandler = Box<dyn Fn(&Envelope) + Send + Sync>;
type HistoryHandler = Box<dyn Fn(&[Envelope]) + Send + Sync>;
type StateHandler = Box<dyn Fn(ConnectionState) + Send + Sync>;

/// Callbacks run on the networking task. They must not block.
#[derive(Default)]
pub struct ClientHandlers {
    on_message: Option<MessageHandler>,
    on_history_replaced: Option<HistoryHandler>,
    on_state_change: Option<StateHandler>,
}

impl ClientHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message(mut self, handler: impl Fn(&Envelope) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Box::new(handler));
        self
    }

    /// Receives the full transcript after a history replay replaced it.
    pub fn on_history_replaced(
        mut self,
        handler: impl Fn(&[Envelope]) + Send + Sync + 'static,
    ) -> Self {
        self.on_history_replaced = Some(Box::new(handler));
        self
    }

    pub fn on_state_change(
        mut self,
        handler: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) -> Self {
        self.on_state_change = Some(Box::new(handler));
        self
    }
}

impl fmt::Debug for ClientHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandlers")
            .field("on_message", &self.on_message.is_some())
            .field("on_history_replaced", &self.on_history_replaced.is_some())
            .field("on_state_change", &self.on_state_change.is_some())
            .finish()
    }
}

#[derive(Debug)]
enum ClientCommand {
    Send(Envelope),
    ForceReconnect,
    Shutdown,
}

#[derive(Debug)]
struct ClientShared {
    endpoint: RwLock<String>,
    user_name: RwLock<String>,
    transcript: Mutex<Transcript>,
    state_tx: watch::Sender<ConnectionState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_string(lock: &RwLock<String>) -> String {
    lock.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn write_string(lock: &RwLock<String>, value: String) {
    *lock.write().unwrap_or_else(PoisonError::into_inner) = value;
}

/// Caller-facing handle to a reconnecting relay connection. Cheap to clone;
/// every clone drives the same background loop.
#[derive(Debug, Clone)]
pub struct PeerClient {
    shared: Arc<ClientShared>,
    commands: mpsc::UnboundedSender<ClientCommand>,
}

/// The reconnect loop behind a [`PeerClient`]. Commands sent through the
/// handle before [`ClientRuntime::run`] is polled stay queued.
#[derive(Debug)]
pub struct ClientRuntime {
    config: ClientConfig,
    shared: Arc<ClientShared>,
    handlers: ClientHandlers,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
}

impl PeerClient {
    pub fn new(config: ClientConfig, handlers: ClientHandlers) -> (Self, ClientRuntime) {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(ClientShared {
            endpoint: RwLock::new(config.endpoint.clone()),
            user_name: RwLock::new(config.user_name.clone()),
            transcript: Mutex::new(Transcript::with_capacity(config.transcript_max)),
            state_tx,
        });
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let client = Self {
            shared: Arc::clone(&shared),
            commands: command_tx,
        };
        let runtime = ClientRuntime {
            config,
            shared,
            handlers,
            commands: command_rx,
        };
        (client, runtime)
    }

    /// Creates the client and spawns its reconnect loop on the current
    /// tokio runtime.
    pub fn connect(config: ClientConfig, handlers: ClientHandlers) -> Self {
        let (client, runtime) = Self::new(config, handlers);
        tokio::spawn(runtime.run());
        client
    }

    /// Queues a message for the relay and appends it to the local
    /// transcript, since the relay never echoes it back. While
    /// disconnected the message is logged and dropped by the loop.
    pub fn send(
        &self,
        text: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Result<Envelope, ClientError> {
        let envelope = Envelope::outgoing(self.user_name(), text, attachments);
        if !envelope.has_content() {
            return Err(ClientError::EmptyMessage);
        }
        self.send_envelope(envelope.clone())?;

        let mut local = envelope;
        local.ts = Some(timestamp_now());
        lock(&self.shared.transcript).push(local.clone());
        Ok(local)
    }

    /// Queues an envelope as-is, without touching the transcript.
    pub fn send_envelope(&self, envelope: Envelope) -> Result<(), ClientError> {
        self.commands
            .send(ClientCommand::Send(envelope))
            .map_err(|_| ClientError::NotRunning)
    }

    /// Closes the current connection (if any) and dials the configured
    /// endpoint again without waiting for a backoff step.
    pub fn force_reconnect(&self) -> Result<(), ClientError> {
        self.commands
            .send(ClientCommand::ForceReconnect)
            .map_err(|_| ClientError::NotRunning)
    }

    /// Takes effect on the next dial; pair with [`Self::force_reconnect`].
    pub fn set_endpoint(&self, endpoint: impl Into<String>) {
        write_string(&self.shared.endpoint, endpoint.into());
    }

    pub fn endpoint(&self) -> String {
        read_string(&self.shared.endpoint)
    }

    pub fn set_user_name(&self, user_name: impl Into<String>) {
        write_string(&self.shared.user_name, user_name.into());
    }

    pub fn user_name(&self) -> String {
        read_string(&self.shared.user_name)
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn transcript(&self) -> Vec<Envelope> {
        lock(&self.shared.transcript).entries()
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Stops the reconnect loop and waits for it to exit.
    pub async fn shutdown(&self) {
        if self.commands.send(ClientCommand::Shutdown).is_err() {
            return;
        }
        self.commands.closed().await;
    }
}

enum DialOutcome {
    Connected(Box<WsStream>),
    Failed,
    Forced,
    Shutdown,
}

enum SessionEnd {
    Dropped,
    Forced,
    Shutdown,
}

enum WaitOutcome {
    Elapsed,
    Forced,
    Shutdown,
}

impl ClientRuntime {
    /// Runs until [`PeerClient::shutdown`] is called or every handle is
    /// dropped. Failed dials and dropped sessions back off 1, 2, 4, 8, 10
    /// units; a successful connect resets the sequence.
    pub async fn run(mut self) {
        let mut backoff = Backoff::new(self.config.backoff_unit);

        loop {
            let endpoint = read_string(&self.shared.endpoint);
            self.set_state(ConnectionState::Connecting);

            match self.dial(&endpoint).await {
                DialOutcome::Connected(ws) => {
                    info!(endpoint = %endpoint, "connected");
                    backoff.reset();
                    self.set_state(ConnectionState::Connected);
                    let end = self.drive_session(*ws).await;
                    self.set_state(ConnectionState::Disconnected);
                    match end {
                        SessionEnd::Dropped => info!(endpoint = %endpoint, "connection lost"),
                        SessionEnd::Forced => continue,
                        SessionEnd::Shutdown => break,
                    }
                }
                DialOutcome::Failed => self.set_state(ConnectionState::Disconnected),
                DialOutcome::Forced => continue,
                DialOutcome::Shutdown => break,
            }

            let delay = backoff.next_delay();
            debug!(?delay, "reconnecting after backoff");
            match self.wait(delay).await {
                WaitOutcome::Elapsed | WaitOutcome::Forced => {}
                WaitOutcome::Shutdown => break,
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("client stopped");
    }

    async fn dial(&mut self, endpoint: &str) -> DialOutcome {
        let connect = timeout(self.config.connect_timeout, connect_async(endpoint));
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok(Ok((ws, _))) => DialOutcome::Connected(Box::new(ws)),
                        Ok(Err(err)) => {
                            warn!(endpoint = %endpoint, "connect failed: {err}");
                            DialOutcome::Failed
                        }
                        Err(_) => {
                            warn!(
                                endpoint = %endpoint,
                                "connect timed out after {:?}",
                                self.config.connect_timeout
                            );
                            DialOutcome::Failed
                        }
                    };
                }
                command = self.commands.recv() => match command {
                    Some(ClientCommand::Send(_)) => warn!("not connected, dropping outgoing message"),
                    Some(ClientCommand::ForceReconnect) => return DialOutcome::Forced,
                    Some(ClientCommand::Shutdown) | None => return DialOutcome::Shutdown,
                },
            }
        }
    }

    async fn wait(&mut self, delay: Duration) -> WaitOutcome {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return WaitOutcome::Elapsed,
                command = self.commands.recv() => match command {
                    Some(ClientCommand::Send(_)) => warn!("not connected, dropping outgoing message"),
                    Some(ClientCommand::ForceReconnect) => return WaitOutcome::Forced,
                    Some(ClientCommand::Shutdown) | None => return WaitOutcome::Shutdown,
                },
            }
        }
    }

    async fn drive_session(&mut self, ws: WsStream) -> SessionEnd {
        let (mut write, mut read) = ws.split();
        let idle_limit = self.config.keepalive_interval + self.config.keepalive_timeout;
        let mut last_inbound = Instant::now();
        // The relay's replay, if any, is the first frame of a session.
        let mut replay_pending = true;
        let mut ping_interval = tokio::time::interval(self.config.keepalive_interval);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(ClientCommand::Send(envelope)) => {
                        let frame = match encode_frame(&Frame::Envelope(envelope)) {
                            Ok(frame) => frame,
                            Err(err) => {
                                warn!("failed to encode outgoing message: {err}");
                                continue;
                            }
                        };
                        if let Err(err) = write.send(Message::Text(frame.into())).await {
                            warn!("send failed: {err}");
                            return SessionEnd::Dropped;
                        }
                    }
                    Some(ClientCommand::ForceReconnect) => {
                        info!("forced reconnect, closing connection");
                        close_normally(&mut write, "reconnecting").await;
                        return SessionEnd::Forced;
                    }
                    Some(ClientCommand::Shutdown) | None => {
                        close_normally(&mut write, "shutting down").await;
                        return SessionEnd::Shutdown;
                    }
                },
                _ = ping_interval.tick() => {
                    if write.send(Message::Ping(Vec::new().into())).await.is_err() {
                        return SessionEnd::Dropped;
                    }
                }
                _ = sleep_until(last_inbound + idle_limit) => {
                    warn!("no traffic for {:?}, reconnecting", idle_limit);
                    return SessionEnd::Dropped;
                }
                next = read.next() => {
                    last_inbound = Instant::now();
                    match next {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_inbound(text.as_str(), &mut replay_pending);
                        }
                        Some(Ok(Message::Close(_))) | None => return SessionEnd::Dropped,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!("read failed: {err}");
                            return SessionEnd::Dropped;
                        }
                    }
                }
            }
        }
    }

    fn handle_inbound(&self, text: &str, replay_pending: &mut bool) {
        let replay_allowed = std::mem::replace(replay_pending, false);
        match decode_frame(text) {
            Ok(Frame::History(items)) if !replay_allowed => {
                debug!(entries = items.len(), "ignoring history frame mid-session");
            }
            Ok(Frame::Envelope(envelope)) => {
                lock(&self.shared.transcript).push(envelope.clone());
                if let Some(handler) = &self.handlers.on_message {
                    handler(&envelope);
                }
            }
            Ok(Frame::History(items)) => {
                let entries = {
                    let mut transcript = lock(&self.shared.transcript);
                    transcript.replace(items);
                    transcript.entries()
                };
                debug!(entries = entries.len(), "transcript replaced by history replay");
                if let Some(handler) = &self.handlers.on_history_replaced {
                    handler(&entries);
                }
            }
            Err(err) => debug!("dropping undecodable frame: {err}"),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.shared.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed && let Some(handler) = &self.handlers.on_state_change {
            handler(state);
        }
    }
}

async fn close_normally<S>(write: &mut S, reason: &'static str)
where
    S: Sink<Message> + Unpin,
{
    let _ = write
        .send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: Utf8Bytes::from_static(reason),
        })))
        .await;
    let _ = write.close().await;
}
