//! vMix TCP tally change notifier.
//!
//! Holds a long-lived connection to the vMix TCP API, subscribes to tally
//! notifications and turns every `TALLY OK` line into a payload-free
//! [`NotifierEvent::Changed`]. The line content is not interpreted; the
//! authoritative state comes from the HTTP fetcher.
//!
//! Flow:
//! 1. Connect (with timeout) and send `SUBSCRIBE TALLY\r\n`
//! 2. Emit `Connected`, then `Changed` for each `TALLY OK` line
//! 3. On EOF or socket error emit `Disconnected` and retry after a fixed delay
//!
//! Socket errors are never fatal; only the shutdown signal ends the loop.

use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use super::TallyError;

/// Subscribe command sent after connecting
pub const SUBSCRIBE_COMMAND: &[u8] = b"SUBSCRIBE TALLY\r\n";

/// Prefix of a tally change notification line
pub const CHANGE_PREFIX: &str = "TALLY OK";

const MAX_PENDING_BYTES: usize = 64 * 1024;

/// Connection status and change notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifierEvent {
    /// A connection attempt is starting
    Connecting,
    /// Connected and subscribed
    Connected,
    /// Tally changed on the mixer
    Changed,
    /// Connection lost or attempt failed (reason)
    Disconnected(String),
}

/// Notifier configuration
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub host: String,
    /// vMix TCP API port (8099 by default)
    pub port: u16,
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl NotifierConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// Splits a byte stream into `\r\n`-terminated lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append a chunk and return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.windows(2).position(|w| w == b"\r\n") {
            let line: Vec<u8> = self.pending.drain(..pos + 2).take(pos).collect();
            lines.push(String::from_utf8_lossy(&line).to_string());
        }

        if self.pending.len() > MAX_PENDING_BYTES {
            warn!("[Tally] Discarding {} bytes without line terminator", self.pending.len());
            self.pending.clear();
        }

        lines
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// TCP change notifier
pub struct TallyNotifier {
    config: NotifierConfig,
    events: mpsc::Sender<NotifierEvent>,
}

impl TallyNotifier {
    pub fn new(config: NotifierConfig, events: mpsc::Sender<NotifierEvent>) -> Self {
        Self { config, events }
    }

    /// Run until `shutdown` flips to true (or its sender is dropped).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!("[Tally] Notifier started for {}", addr);

        loop {
            if *shutdown.borrow() {
                break;
            }

            if self.events.send(NotifierEvent::Connecting).await.is_err() {
                break;
            }

            let reason = tokio::select! {
                reason = self.session(&addr) => reason,
                _ = shutdown.changed() => break,
            };

            warn!("[Tally] Disconnected from {}: {}", addr, reason);
            if self.events.send(NotifierEvent::Disconnected(reason)).await.is_err() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("[Tally] Notifier stopped");
    }

    /// One connection lifetime. Returns the reason it ended.
    async fn session(&self, addr: &str) -> String {
        let mut stream = match self.subscribe(addr).await {
            Ok(stream) => stream,
            Err(e) => return e.to_string(),
        };

        info!("[Tally] Subscribed to tally on {}", addr);
        if self.events.send(NotifierEvent::Connected).await.is_err() {
            return "event receiver closed".to_string();
        }

        let mut lines = LineBuffer::default();
        let mut chunk = [0u8; 1024];

        loop {
            let n = match stream.read(&mut chunk).await {
                Ok(0) => return "connection closed by vMix".to_string(),
                Ok(n) => n,
                Err(e) => return format!("read failed: {}", e),
            };

            for line in lines.push(&chunk[..n]) {
                if line.starts_with(CHANGE_PREFIX) {
                    debug!("[Tally] {}", line);
                    if self.events.send(NotifierEvent::Changed).await.is_err() {
                        return "event receiver closed".to_string();
                    }
                }
            }
        }
    }

    async fn subscribe(&self, addr: &str) -> Result<TcpStream, TallyError> {
        let mut stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TallyError::Connect(format!("timed out connecting to {}", addr)))?
            .map_err(|e| TallyError::Connect(format!("{}: {}", addr, e)))?;

        let _ = stream.set_nodelay(true);
        stream
            .write_all(SUBSCRIBE_COMMAND)
            .await
            .map_err(|e| TallyError::Connect(format!("subscribe failed: {}", e)))?;

        Ok(stream)
    }
}
