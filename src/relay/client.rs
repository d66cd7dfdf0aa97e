//! Outbound WebSocket relay client.
//!
//! Forwards tally and stream status messages to the ReturnFeed relay
//! server. Messages are queued in memory and flushed whenever a connection
//! is up; nothing is persisted across restarts and there is no
//! application-level acknowledgement.
//!
//! Flow:
//! 1. Connect to the relay URL (ws:// or wss://)
//! 2. Flush any message whose send failed on the previous connection
//! 3. Drain the queue, answer server `ping` messages, send our own `ping`
//! 4. On close, error or prolonged server silence wait and reconnect

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{Sink, SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::tally::TallyState;

use super::message::{MessageKind, RelayMessage};
use super::RelayError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Budget for the client task to close its socket on stop
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);
type WsSink = SplitSink<WsStream, Message>;

/// Relay connection settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Relay URL; empty disables the relay
    pub url: String,
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
    /// Interval of client-initiated `ping` messages
    pub ping_interval: Duration,
    /// Silence from the server after which the connection is considered dead
    pub server_timeout: Duration,
}

impl RelayConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            ping_interval: Duration::from_secs(90),
            server_timeout: Duration::from_secs(180),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.url.trim().is_empty()
    }

    /// Parse the relay URL, accepting only `ws` and `wss`.
    pub fn parse_url(&self) -> Result<Url, RelayError> {
        let url = Url::parse(self.url.trim()).map_err(|e| RelayError::Connect(format!("{}: {}", self.url, e)))?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(RelayError::Connect(format!("unsupported scheme {:?} in {}", other, self.url))),
        }
    }
}

/// Connection status and inbound traffic
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Connecting,
    Connected,
    Disconnected(String),
    Received(RelayMessage),
}

/// Relay statistics
#[derive(Default)]
pub struct RelayStats {
    pub connected: AtomicBool,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub connections: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub connected: bool,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub connections: u64,
}

impl RelayStats {
    pub fn to_snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            connected: self.connected.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
        }
    }
}

/// Cheap, cloneable sender side of the relay queue. Never blocks.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<RelayMessage>,
}

/// Create a relay queue: the handle for producers, the receiver for [`RelayClient::run`].
pub fn relay_queue() -> (RelayHandle, mpsc::UnboundedReceiver<RelayMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RelayHandle { tx }, rx)
}

impl RelayHandle {
    /// Queue a message. Returns false once the client has shut down.
    pub fn send(&self, message: RelayMessage) -> bool {
        match self.tx.send(message) {
            Ok(()) => true,
            Err(e) => {
                debug!("[Relay] Dropping {:?} message, client stopped", e.0.kind);
                false
            }
        }
    }

    pub fn send_tally_update(&self, state: &TallyState) -> bool {
        self.send(RelayMessage::tally_update(state))
    }

    pub fn send_input_list(&self, state: &TallyState) -> bool {
        self.send(RelayMessage::input_list(state))
    }

    pub fn send_stream_status(&self, stream_name: &str, status: &str) -> bool {
        self.send(RelayMessage::stream_status(stream_name, status))
    }

    pub fn send_auth_info(&self, user_id: &str, unique_address: &str) -> bool {
        self.send(RelayMessage::auth_info(user_id, unique_address))
    }
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

/// WebSocket relay client with its own reconnect loop
pub struct RelayClient {
    config: RelayConfig,
    events: mpsc::Sender<RelayEvent>,
    stats: Arc<RelayStats>,
}

impl RelayClient {
    pub fn new(config: RelayConfig, events: mpsc::Sender<RelayEvent>) -> Self {
        Self {
            config,
            events,
            stats: Arc::new(RelayStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        self.stats.clone()
    }

    async fn emit(&self, event: RelayEvent) {
        // Nobody listening is fine; the relay keeps working
        let _ = self.events.send(event).await;
    }

    /// Run until `shutdown` flips to true.
    pub async fn run(self, mut queue: mpsc::UnboundedReceiver<RelayMessage>, mut shutdown: watch::Receiver<bool>) {
        if !self.config.is_enabled() {
            info!("[Relay] No relay URL configured, relay disabled");
            loop {
                tokio::select! {
                    msg = queue.recv() => match msg {
                        Some(msg) => debug!("[Relay] Disabled, dropping {:?}", msg.kind),
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            return;
        }

        let mut pending: Option<RelayMessage> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.emit(RelayEvent::Connecting).await;
            info!("[Relay] Connecting to {}", self.config.url);

            let reason = tokio::select! {
                result = self.connect() => match result {
                    Ok(ws) => {
                        self.stats.connected.store(true, Ordering::SeqCst);
                        self.stats.connections.fetch_add(1, Ordering::Relaxed);
                        info!("[Relay] Connected to {}", self.config.url);
                        self.emit(RelayEvent::Connected).await;

                        let end = self.session(ws, &mut queue, &mut pending, &mut shutdown).await;
                        self.stats.connected.store(false, Ordering::SeqCst);
                        match end {
                            SessionEnd::Shutdown => break,
                            SessionEnd::Lost(reason) => reason,
                        }
                    }
                    Err(e) => e.to_string(),
                },
                _ = shutdown.changed() => break,
            };

            warn!("[Relay] Disconnected: {} (retrying in {:?})", reason, self.config.reconnect_delay);
            self.emit(RelayEvent::Disconnected(reason)).await;

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.stats.connected.store(false, Ordering::SeqCst);
        info!("[Relay] Client stopped");
    }

    async fn connect(&self) -> Result<WsStream, RelayError> {
        let url = self.config.parse_url()?;
        let (ws, _) = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .map_err(|_| RelayError::Connect(format!("handshake timed out after {:?}", self.config.connect_timeout)))?
        .map_err(|e| RelayError::Connect(e.to_string()))?;
        Ok(ws)
    }

    async fn session(
        &self,
        ws: WsStream,
        queue: &mut mpsc::UnboundedReceiver<RelayMessage>,
        pending: &mut Option<RelayMessage>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let (mut sink, mut source) = ws.split();

        if let Some(message) = pending.take() {
            if let Err(e) = self.forward(&mut sink, message, pending).await {
                return SessionEnd::Lost(e.to_string());
            }
        }

        let mut ping = tokio::time::interval_at(Instant::now() + self.config.ping_interval, self.config.ping_interval);
        let mut idle_check = tokio::time::interval(Duration::from_secs(1));
        let mut last_signal = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    // last statuses (e.g. `stopped`) go out before the close frame
                    while let Ok(message) = queue.try_recv() {
                        if self.send(&mut sink, &message).await.is_err() {
                            break;
                        }
                    }
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                message = queue.recv() => match message {
                    Some(message) => {
                        if let Err(e) = self.forward(&mut sink, message, pending).await {
                            return SessionEnd::Lost(e.to_string());
                        }
                    }
                    // Every handle dropped: nothing left to relay
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return SessionEnd::Shutdown;
                    }
                },
                frame = source.next() => {
                    last_signal = Instant::now();
                    if let Err(reason) = self.handle_frame(frame, &mut sink).await {
                        return SessionEnd::Lost(reason);
                    }
                }
                _ = ping.tick() => {
                    if let Err(e) = self.send(&mut sink, &RelayMessage::ping()).await {
                        return SessionEnd::Lost(e.to_string());
                    }
                }
                _ = idle_check.tick() => {
                    if last_signal.elapsed() > self.config.server_timeout {
                        return SessionEnd::Lost(format!(
                            "no signal from server for {:?}",
                            self.config.server_timeout
                        ));
                    }
                }
            }
        }
    }

    async fn handle_frame(
        &self,
        frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
        sink: &mut WsSink,
    ) -> Result<(), String> {
        match frame {
            Some(Ok(Message::Text(text))) => {
                self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                match RelayMessage::from_json(&text) {
                    Ok(message) => {
                        if message.kind == MessageKind::Ping {
                            self.send(sink, &RelayMessage::pong())
                                .await
                                .map_err(|e| e.to_string())?;
                        }
                        self.emit(RelayEvent::Received(message)).await;
                    }
                    Err(e) => warn!("[Relay] Ignoring malformed message: {}", e),
                }
                Ok(())
            }
            // tungstenite queues the Pong for protocol-level pings itself
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => Ok(()),
            Some(Ok(Message::Binary(data))) => {
                debug!("[Relay] Ignoring {} byte binary frame", data.len());
                Ok(())
            }
            Some(Ok(Message::Close(frame))) => Err(match frame {
                Some(frame) => format!("closed by server: {} {}", frame.code, frame.reason),
                None => "closed by server".to_string(),
            }),
            Some(Ok(Message::Frame(_))) => Ok(()),
            Some(Err(e)) => Err(format!("receive failed: {}", e)),
            None => Err("connection closed".to_string()),
        }
    }

    /// Send `message`; on failure it is parked in `pending` for the next connection.
    async fn forward<S>(&self, sink: &mut S, message: RelayMessage, pending: &mut Option<RelayMessage>) -> Result<(), RelayError>
    where
        S: Sink<Message> + Unpin,
        S::Error: std::fmt::Display,
    {
        let result = self.send(sink, &message).await;
        if result.is_err() {
            *pending = Some(message);
        }
        result
    }

    async fn send<S>(&self, sink: &mut S, message: &RelayMessage) -> Result<(), RelayError>
    where
        S: Sink<Message> + Unpin,
        S::Error: std::fmt::Display,
    {
        let json = message.to_json()?;
        sink.send(Message::Text(json))
            .await
            .map_err(|e| RelayError::Send(e.to_string()))?;
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        debug!("[Relay] Sent {:?}", message.kind);
        Ok(())
    }
}

/// A relay client running on its own task, stopped independently of any
/// outstanding [`RelayHandle`] clones.
pub struct RelayService {
    handle: RelayHandle,
    shutdown: watch::Sender<bool>,
    stats: Arc<RelayStats>,
    task: JoinHandle<()>,
}

impl RelayService {
    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.to_snapshot()
    }

    /// Signal the client and wait for it to close its connection.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let abort = self.task.abort_handle();
        if tokio::time::timeout(JOIN_TIMEOUT, self.task).await.is_err() {
            warn!("[Relay] Client did not stop within {:?}, aborting", JOIN_TIMEOUT);
            abort.abort();
        }
    }
}

/// Start a relay client on the current tokio runtime.
pub fn spawn(config: RelayConfig, events: mpsc::Sender<RelayEvent>) -> RelayService {
    let (handle, queue) = relay_queue();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let client = RelayClient::new(config, events);
    let stats = client.stats();
    let task = tokio::spawn(client.run(queue, shutdown_rx));

    RelayService {
        handle,
        shutdown,
        stats,
        task,
    }
}
