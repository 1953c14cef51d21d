use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex, PoisonError,
    },
    time::Duration,
};

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::Utc;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use shared::{
    domain::{ConnectionState, ConnectionStatus},
    protocol::PingFrame,
};
use thiserror::Error;
use tokio::{net::TcpStream, sync::Mutex, task::JoinHandle};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::ClientConfig,
    events::{HandlerRegistry, Subscription},
    token::TokenStore,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

const NORMAL_CLOSURE: u16 = 1000;
const FORCE_RECONNECT_DELAY: Duration = Duration::from_secs(1);

static SOCKET_IDS: AtomicU64 = AtomicU64::new(0);

/// Cloneable write handle for the live socket. A new instance is created per
/// connection attempt; `is_open` flips to false once the reader observes the
/// stream ending, so stale clones refuse further sends.
#[derive(Clone)]
pub struct OutboundSocket {
    id: u64,
    sink: Arc<Mutex<WsSink>>,
    open: Arc<AtomicBool>,
}

impl OutboundSocket {
    fn new(sink: WsSink) -> Self {
        Self {
            id: SOCKET_IDS.fetch_add(1, Ordering::Relaxed),
            sink: Arc::new(Mutex::new(sink)),
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub async fn send_text(&self, text: String) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text)).await
    }

    async fn close(&self) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        self.mark_closed();
        let mut sink = self.sink.lock().await;
        sink.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "manual disconnect".into(),
        })))
        .await
    }
}

/// Sink for socket-lifecycle events, implemented by the message channel: each
/// inbound text frame is forwarded, and every successful open hands over the
/// fresh socket so queued sends can flush against it.
#[async_trait]
pub trait SocketEvents: Send + Sync {
    async fn frame_received(&self, raw: String);
    async fn socket_opened(&self, socket: OutboundSocket);
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("no authentication token available")]
    NoCredential,
    #[error("connection attempt already in progress")]
    AlreadyConnecting,
}

#[derive(Debug, Default)]
struct SocketClose {
    code: Option<u16>,
    error: Option<String>,
}

struct ManagerState {
    socket: Option<OutboundSocket>,
    reader_task: Option<JoinHandle<()>>,
    heartbeat_task: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    connecting: bool,
    auto_reconnect: bool,
    reconnect_attempts: u32,
    healthy: bool,
}

/// Owns the single websocket connection and its lifecycle: authenticated
/// connect, manual disconnect, exponential-backoff reconnection, and the
/// status stream observers learn every transition from.
pub struct ConnectionManager {
    config: ClientConfig,
    tokens: Arc<dyn TokenStore>,
    events: Arc<dyn SocketEvents>,
    status_handlers: HandlerRegistry<ConnectionStatus>,
    status: StdMutex<ConnectionStatus>,
    inner: Mutex<ManagerState>,
}

impl ConnectionManager {
    pub fn new(
        config: ClientConfig,
        tokens: Arc<dyn TokenStore>,
        events: Arc<dyn SocketEvents>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            tokens,
            events,
            status_handlers: HandlerRegistry::new(),
            status: StdMutex::new(ConnectionStatus::default()),
            inner: Mutex::new(ManagerState {
                socket: None,
                reader_task: None,
                heartbeat_task: None,
                reconnect_timer: None,
                connecting: false,
                auto_reconnect: true,
                reconnect_attempts: 0,
                healthy: false,
            }),
        })
    }

    /// Opens the socket, embedding the current access token as a query
    /// credential. Resolves immediately when a socket is already open.
    ///
    /// Only credential absence and an attempt already in flight are returned
    /// to the caller; handshake failures surface on the status stream and
    /// schedule a retry while attempts remain.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ConnectError> {
        let Some(token) = self.tokens.access_token() else {
            warn!("websocket connect refused: no access token");
            self.publish_transition(|status| {
                status.state = ConnectionState::Disconnected;
                status.error = Some("no authentication token available".to_string());
            });
            return Err(ConnectError::NoCredential);
        };

        let attempts = {
            let mut state = self.inner.lock().await;
            if state.socket.as_ref().is_some_and(OutboundSocket::is_open) {
                return Ok(());
            }
            if state.connecting {
                return Err(ConnectError::AlreadyConnecting);
            }
            state.connecting = true;
            state.auto_reconnect = true;
            state.reconnect_attempts
        };

        self.publish_transition(|status| {
            status.state = ConnectionState::Connecting;
            status.reconnect_attempts = attempts;
            status.error = None;
        });

        let url = match self.websocket_url(&token) {
            Ok(url) => url,
            Err(err) => {
                warn!(error = %err, "failed to build websocket url");
                self.inner.lock().await.connecting = false;
                self.publish_transition(|status| {
                    status.state = ConnectionState::Disconnected;
                    status.error = Some(format!("failed to create websocket connection: {err}"));
                });
                return Ok(());
            }
        };

        match connect_async(url.as_str()).await {
            Ok((stream, _response)) => {
                let (sink, reader) = stream.split();
                let socket = OutboundSocket::new(sink);
                {
                    let mut state = self.inner.lock().await;
                    state.connecting = false;
                    state.reconnect_attempts = 0;
                    state.healthy = true;
                    if let Some(timer) = state.reconnect_timer.take() {
                        timer.abort();
                    }
                    if let Some(task) = state.heartbeat_task.take() {
                        task.abort();
                    }
                    if let Some(task) = state.reader_task.take() {
                        task.abort();
                    }
                    state.socket = Some(socket.clone());
                }
                info!(socket_id = socket.id(), "websocket connected");
                self.publish_transition(|status| {
                    status.state = ConnectionState::Connected;
                    status.last_connected = Some(Utc::now());
                    status.reconnect_attempts = 0;
                    status.error = None;
                });
                self.events.socket_opened(socket.clone()).await;
                let reader_task = self.spawn_reader(reader, socket.clone());
                let heartbeat_task = self.spawn_heartbeat(socket.clone());
                {
                    let mut state = self.inner.lock().await;
                    state.reader_task = Some(reader_task);
                    state.heartbeat_task = Some(heartbeat_task);
                }
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "websocket connect failed");
                {
                    let mut state = self.inner.lock().await;
                    state.connecting = false;
                    state.healthy = false;
                }
                self.publish_transition(|status| {
                    status.state = ConnectionState::Disconnected;
                    status.error = Some(format!("failed to establish connection: {err}"));
                });
                self.maybe_schedule_reconnect().await;
                Ok(())
            }
        }
    }

    /// Closes the socket with a normal-closure code and disables automatic
    /// reconnection until `connect` or `force_reconnect` is called again.
    /// Calling it twice emits a single `disconnected` transition.
    pub async fn disconnect(&self) {
        let socket = {
            let mut state = self.inner.lock().await;
            state.auto_reconnect = false;
            state.connecting = false;
            state.healthy = false;
            if let Some(timer) = state.reconnect_timer.take() {
                timer.abort();
            }
            if let Some(task) = state.heartbeat_task.take() {
                task.abort();
            }
            if let Some(task) = state.reader_task.take() {
                task.abort();
            }
            state.socket.take()
        };

        if let Some(socket) = socket {
            if let Err(err) = socket.close().await {
                debug!(error = %err, "error sending close frame during disconnect");
            }
        }

        info!("websocket disconnected manually");
        self.publish_transition(|status| {
            status.state = ConnectionState::Disconnected;
            status.error = None;
        });
    }

    /// User-initiated retry: tears down any socket and pending timers, resets
    /// the attempt counter, and reconnects after a short fixed delay.
    pub async fn force_reconnect(self: &Arc<Self>) {
        self.disconnect().await;

        let manager = Arc::clone(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(FORCE_RECONNECT_DELAY).await;
            if let Err(err) = manager.connect().await {
                warn!(error = %err, "manual reconnect attempt failed");
            }
        });

        let mut state = self.inner.lock().await;
        state.reconnect_attempts = 0;
        state.auto_reconnect = true;
        if let Some(old) = state.reconnect_timer.replace(timer) {
            old.abort();
        }
    }

    /// Registers a status subscriber. The handler is invoked synchronously
    /// with the current status on registration and on every transition after.
    pub fn on_status(
        &self,
        handler: impl Fn(&ConnectionStatus) + Send + Sync + 'static,
    ) -> Subscription {
        let subscription = self.status_handlers.subscribe(handler);
        let current = self.current_status();
        self.status_handlers.notify_one(subscription.id(), &current);
        subscription
    }

    pub fn current_status(&self) -> ConnectionStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// True only while the transport reports open and no close or error has
    /// been observed since the last successful open.
    pub async fn is_healthy(&self) -> bool {
        let state = self.inner.lock().await;
        state.healthy && state.socket.as_ref().is_some_and(OutboundSocket::is_open)
    }

    /// The live outbound handle, if any. Consumers must treat `None` as
    /// "queue or fail"; they never construct sockets themselves.
    pub async fn socket(&self) -> Option<OutboundSocket> {
        self.inner
            .lock()
            .await
            .socket
            .clone()
            .filter(OutboundSocket::is_open)
    }

    fn websocket_url(&self, token: &str) -> anyhow::Result<Url> {
        let base = self.config.ws_base_url.trim_end_matches('/');
        let mut url = Url::parse(&format!("{base}/ws"))
            .with_context(|| format!("invalid websocket base url '{base}'"))?;
        url.query_pairs_mut().append_pair("token", token);
        Ok(url)
    }

    fn spawn_reader(self: &Arc<Self>, mut reader: WsReader, socket: OutboundSocket) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let events = Arc::clone(&self.events);
        tokio::spawn(async move {
            let mut close = SocketClose::default();
            while let Some(message) = reader.next().await {
                match message {
                    Ok(Message::Text(text)) => events.frame_received(text).await,
                    Ok(Message::Close(frame)) => {
                        close.code = frame.map(|f| u16::from(f.code));
                        break;
                    }
                    // binary payloads and transport-level ping/pong are not
                    // part of the chat protocol
                    Ok(_) => {}
                    Err(err) => {
                        close.error = Some(err.to_string());
                        break;
                    }
                }
            }
            socket.mark_closed();
            manager.handle_socket_closed(socket.id(), close).await;
        })
    }

    fn spawn_heartbeat(&self, socket: OutboundSocket) -> JoinHandle<()> {
        let interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !socket.is_open() {
                    break;
                }
                let payload = match serde_json::to_string(&PingFrame::now()) {
                    Ok(payload) => payload,
                    Err(_) => break,
                };
                if let Err(err) = socket.send_text(payload).await {
                    debug!(error = %err, "heartbeat send failed");
                    break;
                }
            }
        })
    }

    async fn handle_socket_closed(self: &Arc<Self>, socket_id: u64, close: SocketClose) {
        {
            let mut state = self.inner.lock().await;
            if state.socket.as_ref().map(OutboundSocket::id) != Some(socket_id) {
                debug!(socket_id, "ignoring close event from a superseded socket");
                return;
            }
            state.socket = None;
            state.reader_task = None;
            if let Some(task) = state.heartbeat_task.take() {
                task.abort();
            }
            state.healthy = false;
            state.connecting = false;
        }

        let normal = close.code == Some(NORMAL_CLOSURE) && close.error.is_none();
        let error = if let Some(err) = close.error {
            Some(format!("websocket transport error: {err}"))
        } else if normal {
            None
        } else {
            Some(match close.code {
                Some(code) => format!("connection closed with code {code}"),
                None => "connection closed unexpectedly".to_string(),
            })
        };

        info!(code = ?close.code, normal, "websocket closed");
        self.publish_transition(|status| {
            status.state = ConnectionState::Disconnected;
            status.error = error.clone();
        });

        if !normal {
            self.maybe_schedule_reconnect().await;
        }
    }

    fn maybe_schedule_reconnect<'a>(
        self: &'a Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
        let (attempt, delay) = {
            let mut state = self.inner.lock().await;
            if !state.auto_reconnect || state.connecting {
                return;
            }
            if state.reconnect_attempts >= self.config.max_reconnect_attempts {
                warn!(
                    attempts = state.reconnect_attempts,
                    "reconnect attempts exhausted; waiting for manual retry"
                );
                return;
            }
            state.reconnect_attempts += 1;
            let attempt = state.reconnect_attempts;
            let delay = backoff_delay(self.config.reconnect_base_delay, attempt);

            let manager = Arc::clone(self);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(err) = manager.connect().await {
                    warn!(error = %err, "scheduled reconnect attempt failed");
                }
            });
            if let Some(old) = state.reconnect_timer.replace(timer) {
                old.abort();
            }
            (attempt, delay)
        };

        info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        self.publish_transition(|status| {
            status.state = ConnectionState::Reconnecting;
            status.reconnect_attempts = attempt;
            status.error = Some(format!(
                "reconnecting in {} seconds",
                delay.as_secs_f64().ceil() as u64
            ));
        });
        })
    }

    /// Applies a status mutation and notifies subscribers. A transition that
    /// leaves the status unchanged is swallowed, so each real transition
    /// fires exactly once.
    fn publish_transition(&self, update: impl FnOnce(&mut ConnectionStatus)) {
        let emitted = {
            let mut current = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            let mut next = current.clone();
            update(&mut next);
            if next == *current {
                None
            } else {
                *current = next.clone();
                Some(next)
            }
        };
        if let Some(status) = emitted {
            self.status_handlers.notify(&status);
        }
    }
}

/// Delay before reconnect attempt `n` (1-indexed): `base * 2^(n-1)`.
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * 2u32.saturating_pow(attempt.saturating_sub(1))
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
