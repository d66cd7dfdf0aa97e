//! FFmpeg process supervision.
//!
//! One supervisor owns at most one FFmpeg child. Two tasks accompany it:
//! a stderr reader that keeps [`StreamStats`] current, and a waiter that
//! owns the child, reports its exit and performs the graceful stop
//! (SIGTERM, wait, force kill). Failures are reported, never retried; the
//! operator starts again.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::relay::RelayHandle;

use super::ffmpeg::{build_args, LatencyMode, StreamParams};
use super::latency::{NetworkSnapshot, DEFAULT_LATENCY_MS};
use super::mediamtx::{MediaMtxClient, MediaMtxEndpoint};
use super::progress::{is_error_line, parse_progress, ProgressSplitter, StreamStats};
use super::StreamError;

/// Grace period between the stop request and a forced kill
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget for the stderr reader to drain after exit
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle notifications
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// FFmpeg reported its first progress line
    Started { stream_name: String },
    /// Spawn failure, unexpected exit, or FFmpeg error output
    Error(String),
    Exited {
        stream_name: String,
        code: Option<i32>,
        /// True if the exit followed a stop request
        requested: bool,
    },
}

/// Description of the running session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub stream_name: String,
    pub params: StreamParams,
    pub srt_url: String,
    pub latency_ms: u32,
    pub started_at: Instant,
}

struct ActiveSession {
    info: SessionInfo,
    stop_tx: Option<oneshot::Sender<()>>,
    waiter: JoinHandle<()>,
    reader: JoinHandle<()>,
    stats: Arc<Mutex<StreamStats>>,
}

/// FFmpeg → MediaMTX SRT publisher
pub struct StreamSupervisor {
    ffmpeg: String,
    endpoint: MediaMtxEndpoint,
    events: mpsc::Sender<StreamEvent>,
    relay: Option<RelayHandle>,
    network: Option<watch::Receiver<NetworkSnapshot>>,
    stop_timeout: Duration,
    streaming: Arc<AtomicBool>,
    session: Option<ActiveSession>,
}

impl StreamSupervisor {
    pub fn new(ffmpeg: impl Into<String>, endpoint: MediaMtxEndpoint, events: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            endpoint,
            events,
            relay: None,
            network: None,
            stop_timeout: STOP_TIMEOUT,
            streaming: Arc::new(AtomicBool::new(false)),
            session: None,
        }
    }

    /// Report `started`/`stopped`/`error` stream status to the relay.
    pub fn with_relay(mut self, relay: RelayHandle) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Latency source for [`LatencyMode::Adaptive`].
    pub fn with_network_monitor(mut self, snapshot: watch::Receiver<NetworkSnapshot>) -> Self {
        self.network = Some(snapshot);
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &MediaMtxEndpoint {
        &self.endpoint
    }

    /// True while the FFmpeg child is alive
    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    pub fn session(&self) -> Option<&SessionInfo> {
        self.session.as_ref().map(|s| &s.info)
    }

    /// Snapshot of the running (or last) session's statistics
    pub fn stats(&self) -> Option<StreamStats> {
        self.session.as_ref().map(|s| s.stats.lock().clone())
    }

    pub fn uptime(&self) -> Option<Duration> {
        self.session
            .as_ref()
            .filter(|_| self.is_streaming())
            .map(|s| s.info.started_at.elapsed())
    }

    fn resolve_latency(&self, mode: LatencyMode) -> u32 {
        match mode {
            LatencyMode::Manual(ms) => ms,
            LatencyMode::Adaptive => self
                .network
                .as_ref()
                .map(|rx| rx.borrow().latency_ms)
                .unwrap_or(DEFAULT_LATENCY_MS),
        }
    }

    async fn emit(&self, event: StreamEvent) {
        let _ = self.events.send(event).await;
    }

    /// Start publishing `stream_name`. A running session is stopped first.
    pub async fn start(&mut self, params: StreamParams, stream_name: &str) -> Result<SessionInfo, StreamError> {
        params.validate()?;
        if self.session.is_some() {
            self.stop().await;
        }

        let latency_ms = self.resolve_latency(params.latency);
        let srt_url = self.endpoint.publish_url(stream_name);
        let args = build_args(&params, &srt_url, latency_ms);
        info!(
            "[Stream] Starting {} from {} ({} kbps, {} fps, {}, latency {} ms)",
            stream_name,
            params.source,
            params.bitrate_kbps,
            params.fps,
            params.encoder.codec(),
            latency_ms
        );

        let mut child = match Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                let message = format!("Failed to start {}: {}", self.ffmpeg, e);
                error!("[Stream] {}", message);
                self.emit(StreamEvent::Error(message.clone())).await;
                if let Some(relay) = &self.relay {
                    relay.send_stream_status(stream_name, "error");
                }
                return Err(StreamError::Spawn(message));
            }
        };

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| StreamError::Spawn("stderr not captured".to_string()))?;
        let stdin = child.stdin.take();

        let info = SessionInfo {
            stream_name: stream_name.to_string(),
            params,
            srt_url,
            latency_ms,
            started_at: Instant::now(),
        };

        let stats = Arc::new(Mutex::new(StreamStats {
            latency_ms,
            ..Default::default()
        }));
        self.streaming.store(true, Ordering::SeqCst);

        let reader = tokio::spawn(read_stderr(
            stderr,
            stats.clone(),
            stream_name.to_string(),
            self.events.clone(),
            self.relay.clone(),
        ));

        let (stop_tx, stop_rx) = oneshot::channel();
        let waiter = tokio::spawn(wait_for_exit(
            child,
            stdin,
            stop_rx,
            self.stop_timeout,
            stream_name.to_string(),
            self.streaming.clone(),
            stats.clone(),
            self.events.clone(),
            self.relay.clone(),
        ));

        self.session = Some(ActiveSession {
            info: info.clone(),
            stop_tx: Some(stop_tx),
            waiter,
            reader,
            stats,
        });

        Ok(info)
    }

    /// Stop the session (if any) and return its final statistics.
    pub async fn stop(&mut self) -> Option<StreamStats> {
        let mut session = self.session.take()?;
        info!("[Stream] Stopping {}", session.info.stream_name);

        if let Some(stop_tx) = session.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        // the waiter itself force-kills after stop_timeout; this bounds the join
        match tokio::time::timeout(self.stop_timeout + READER_JOIN_TIMEOUT, &mut session.waiter).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("[Stream] Exit watcher failed: {}", e),
            Err(_) => {
                warn!("[Stream] Exit watcher still running, aborting");
                session.waiter.abort();
            }
        }
        if tokio::time::timeout(READER_JOIN_TIMEOUT, &mut session.reader).await.is_err() {
            warn!("[Stream] stderr reader still running, aborting");
            session.reader.abort();
        }

        self.streaming.store(false, Ordering::SeqCst);
        let stats = session.stats.lock().clone();
        Some(stats)
    }

    /// Ask MediaMTX whether the current stream is visible on the server.
    pub async fn verify_active(&self) -> Result<bool, StreamError> {
        let name = match &self.session {
            Some(session) => session.info.stream_name.clone(),
            None => return Ok(false),
        };
        let active = MediaMtxClient::new(self.endpoint.clone()).is_active(&name).await?;
        if !active && self.is_streaming() {
            warn!("[Stream] {} is not visible on {}", name, self.endpoint.server);
        }
        Ok(active)
    }
}

async fn read_stderr(
    mut stderr: ChildStderr,
    stats: Arc<Mutex<StreamStats>>,
    stream_name: String,
    events: mpsc::Sender<StreamEvent>,
    relay: Option<RelayHandle>,
) {
    let mut splitter = ProgressSplitter::default();
    let mut chunk = [0u8; 4096];
    let mut confirmed = false;

    loop {
        let n = match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        for line in splitter.push(&chunk[..n]) {
            if let Some(sample) = parse_progress(&line) {
                stats.lock().apply(&sample);
                if !confirmed {
                    confirmed = true;
                    info!("[Stream] {} is live", stream_name);
                    let _ = events
                        .send(StreamEvent::Started {
                            stream_name: stream_name.clone(),
                        })
                        .await;
                    if let Some(relay) = &relay {
                        relay.send_stream_status(&stream_name, "started");
                    }
                }
            } else if is_error_line(&line) {
                warn!("[Stream] FFmpeg: {}", line);
                stats.lock().last_error = Some(line.clone());
                let _ = events.send(StreamEvent::Error(line)).await;
            }
        }
    }

    if let Some(line) = splitter.finish() {
        if is_error_line(&line) {
            stats.lock().last_error = Some(line);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn wait_for_exit(
    mut child: Child,
    mut stdin: Option<ChildStdin>,
    stop_rx: oneshot::Receiver<()>,
    stop_timeout: Duration,
    stream_name: String,
    streaming: Arc<AtomicBool>,
    stats: Arc<Mutex<StreamStats>>,
    events: mpsc::Sender<StreamEvent>,
    relay: Option<RelayHandle>,
) {
    let (status, requested) = tokio::select! {
        status = child.wait() => (status, false),
        _ = stop_rx => {
            request_exit(&child, stdin.as_mut()).await;
            let status = match tokio::time::timeout(stop_timeout, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!("[Stream] FFmpeg ignored stop request, killing");
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            (status, true)
        }
    };

    streaming.store(false, Ordering::SeqCst);
    let code = status.as_ref().ok().and_then(|s| s.code());
    info!("[Stream] FFmpeg for {} exited (code {:?})", stream_name, code);

    if !requested {
        let detail = stats
            .lock()
            .last_error
            .clone()
            .unwrap_or_else(|| "no error output".to_string());
        let message = format!("FFmpeg exited unexpectedly (code {:?}): {}", code, detail);
        error!("[Stream] {}", message);
        notify(&events, StreamEvent::Error(message));
    }

    if let Some(relay) = &relay {
        relay.send_stream_status(&stream_name, if requested { "stopped" } else { "error" });
    }

    notify(
        &events,
        StreamEvent::Exited {
            stream_name,
            code,
            requested,
        },
    );
}

/// Non-blocking send; `stop()` joins the waiter, so it must never wait on the consumer.
fn notify(events: &mpsc::Sender<StreamEvent>, event: StreamEvent) {
    if let Err(e) = events.try_send(event) {
        debug!("[Stream] Event not delivered: {}", e);
    }
}

/// Ask FFmpeg to finish cleanly: SIGTERM on unix, `q` on stdin elsewhere.
async fn request_exit(child: &Child, stdin: Option<&mut ChildStdin>) {
    #[cfg(unix)]
    {
        let _ = stdin;
        if let Some(pid) = child.id() {
            // SAFETY: plain kill(2) on our own child's pid
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                warn!("[Stream] SIGTERM to {} failed: {}", pid, std::io::Error::last_os_error());
            }
        }
    }

    #[cfg(not(unix))]
    {
        use tokio::io::AsyncWriteExt;

        let _ = child;
        if let Some(stdin) = stdin {
            let _ = stdin.write_all(b"q").await;
            let _ = stdin.flush().await;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::stream::ffmpeg::StreamSource;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    /// Write an executable shell script standing in for ffmpeg
    fn fake_ffmpeg(tag: &str, body: &str) -> PathBuf {
        let dir = crate::config::temp_dir(tag);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ffmpeg");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn params() -> StreamParams {
        StreamParams {
            latency: LatencyMode::Manual(200),
            ..StreamParams::new(StreamSource::Screen)
        }
    }

    async fn next(rx: &mut mpsc::Receiver<StreamEvent>) -> StreamEvent {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for stream event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_progress_confirms_start_and_stop_is_graceful() {
        let script = fake_ffmpeg(
            "ffmpeg-ok",
            "printf 'frame=   42 fps= 30 q=-1.0 size=  100kB time=00:00:01.40 bitrate=2000.0kbits/s speed=1.0x\\r' >&2\nexec sleep 30",
        );
        let (tx, mut rx) = mpsc::channel(16);
        let (relay, mut relay_queue) = crate::relay::relay_queue();
        let mut supervisor = StreamSupervisor::new(script.to_string_lossy(), MediaMtxEndpoint::default(), tx)
            .with_relay(relay);

        let info = supervisor.start(params(), "pd_test").await.unwrap();
        assert_eq!(info.latency_ms, 200);
        assert!(info.srt_url.contains("streamid=publish:pd_test"));

        assert_eq!(
            next(&mut rx).await,
            StreamEvent::Started {
                stream_name: "pd_test".to_string()
            }
        );
        assert!(supervisor.is_streaming());
        assert_eq!(supervisor.stats().unwrap().frames, 42);

        let final_stats = supervisor.stop().await.unwrap();
        assert_eq!(final_stats.frames, 42);
        assert!(!supervisor.is_streaming());
        assert!(supervisor.session().is_none());

        match next(&mut rx).await {
            StreamEvent::Exited { requested, .. } => assert!(requested),
            other => panic!("unexpected event {:?}", other),
        }

        let statuses: Vec<String> = std::iter::from_fn(|| relay_queue.try_recv().ok())
            .map(|m| m.data["status"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(statuses, vec!["started", "stopped"]);
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_reported() {
        let script = fake_ffmpeg(
            "ffmpeg-fail",
            "echo 'Connection to srt://returnfeed.net:8890 failed: Connection refused' >&2\nexit 1",
        );
        let (tx, mut rx) = mpsc::channel(16);
        let mut supervisor = StreamSupervisor::new(script.to_string_lossy(), MediaMtxEndpoint::default(), tx);
        supervisor.start(params(), "pd_fail").await.unwrap();

        let mut exited = None;
        let mut errors = 0;
        while exited.is_none() {
            match next(&mut rx).await {
                StreamEvent::Error(_) => errors += 1,
                StreamEvent::Exited { code, requested, .. } => exited = Some((code, requested)),
                StreamEvent::Started { .. } => panic!("should never go live"),
            }
        }
        assert_eq!(exited, Some((Some(1), false)));
        assert!(errors >= 1);
        assert!(!supervisor.is_streaming());

        let stats = supervisor.stop().await.unwrap();
        assert!(stats.last_error.unwrap().contains("Connection refused"));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_error_event() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut supervisor =
            StreamSupervisor::new("/nonexistent/ffmpeg", MediaMtxEndpoint::default(), tx);

        let err = supervisor.start(params(), "pd_none").await.unwrap_err();
        assert!(matches!(err, StreamError::Spawn(_)));
        assert!(matches!(next(&mut rx).await, StreamEvent::Error(_)));
        assert!(!supervisor.is_streaming());
        assert!(supervisor.stop().await.is_none());
    }

    #[tokio::test]
    async fn test_ignored_sigterm_is_force_killed() {
        let script = fake_ffmpeg("ffmpeg-stubborn", "trap '' TERM\nexec sleep 30");
        let (tx, mut rx) = mpsc::channel(16);
        let mut supervisor = StreamSupervisor::new(script.to_string_lossy(), MediaMtxEndpoint::default(), tx)
            .with_stop_timeout(Duration::from_millis(200));
        supervisor.start(params(), "pd_stubborn").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let started = Instant::now();
        assert!(supervisor.stop().await.is_some());
        assert!(started.elapsed() < Duration::from_secs(4), "stop took {:?}", started.elapsed());
        assert!(!supervisor.is_streaming());

        match next(&mut rx).await {
            StreamEvent::Exited { requested, code, .. } => {
                assert!(requested);
                // killed by SIGKILL, no exit code
                assert_eq!(code, None);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_does_not_wait_on_a_full_event_channel() {
        let script = fake_ffmpeg(
            "ffmpeg-busy",
            "printf 'frame=    1 fps=0.0 q=0.0 size=0kB time=00:00:00.03 bitrate=N/A speed=N/A\\r' >&2\nexec sleep 30",
        );
        // capacity 1 and never drained: Started fills it
        let (tx, _rx) = mpsc::channel(1);
        let mut supervisor = StreamSupervisor::new(script.to_string_lossy(), MediaMtxEndpoint::default(), tx)
            .with_stop_timeout(Duration::from_millis(500));
        supervisor.start(params(), "pd_busy").await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while supervisor.stats().map(|s| s.updates).unwrap_or(0) == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let stopped = tokio::time::timeout(Duration::from_secs(5), supervisor.stop()).await;
        assert!(stopped.is_ok(), "stop blocked on the event channel");
        assert_eq!(stopped.unwrap().unwrap().frames, 1);
    }

    #[tokio::test]
    async fn test_adaptive_latency_follows_monitor() {
        let script = fake_ffmpeg("ffmpeg-adaptive", "exec sleep 30");
        let (tx, _rx) = mpsc::channel(16);
        let (_snapshot_tx, snapshot_rx) = watch::channel(NetworkSnapshot {
            latency_ms: 340,
            ..Default::default()
        });
        let mut supervisor = StreamSupervisor::new(script.to_string_lossy(), MediaMtxEndpoint::default(), tx)
            .with_network_monitor(snapshot_rx);

        let info = supervisor
            .start(
                StreamParams {
                    latency: LatencyMode::Adaptive,
                    ..params()
                },
                "pd_adaptive",
            )
            .await
            .unwrap();
        assert_eq!(info.latency_ms, 340);
        assert!(supervisor.stop().await.is_some());
    }
}
