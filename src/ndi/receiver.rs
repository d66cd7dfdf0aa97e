//! Receiver thread: capture, convert, measure, deliver.
//!
//! Flow per iteration:
//! 1. `capture()` with the bandwidth mode's timeout
//! 2. Video: update FPS (once per second) and bitrate estimate, apply frame
//!    skipping, convert to RGB, `try_send` to the consumer
//! 3. Audio: update the RMS level
//! 4. Nothing: proxy mode sleeps 8 ms, normal mode retries at once
//!
//! A full channel drops the frame; the capture loop never blocks on the
//! consumer. Capture errors are reported and the loop keeps going.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::bitrate::{audio_level_db, estimate_mbps, format_bitrate, normalize_fps, SILENCE_DB};
use super::convert::to_rgb;
use super::frame::{RgbImage, VideoFrame};
use super::source::{BandwidthMode, Captured, FrameSource, SourceProvider};
use super::NdiError;

/// Idle sleep after an empty proxy-mode capture
const PROXY_IDLE: Duration = Duration::from_millis(8);

/// Pause after a capture error
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Receiver settings
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub bandwidth: BandwidthMode,
    /// Deliver every `frame_skip + 1`th frame
    pub frame_skip: u32,
    /// Event channel depth
    pub channel_capacity: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bandwidth: BandwidthMode::Highest,
            frame_skip: 0,
            channel_capacity: 4,
        }
    }
}

/// A delivered frame with its display statistics
#[derive(Debug, Clone)]
pub struct FrameInfo {
    pub image: RgbImage,
    /// `"WIDTHxHEIGHT"`
    pub resolution: String,
    pub fps: f64,
    /// Formatted estimate, e.g. `"165.2 Mbps"`
    pub bitrate: String,
    pub audio_level_db: f32,
    /// 1-based count of captured video frames, skipped ones included
    pub sequence: u64,
}

#[derive(Debug)]
pub enum ReceiverEvent {
    Frame(FrameInfo),
    Error(String),
    /// The capture thread has exited; the channel closes after this
    Stopped,
}

/// Receiver counters
#[derive(Default)]
pub struct ReceiverStats {
    pub video_frames: AtomicU64,
    pub audio_frames: AtomicU64,
    pub frames_delivered: AtomicU64,
    pub frames_skipped: AtomicU64,
    /// Dropped because the consumer was behind
    pub frames_dropped: AtomicU64,
    pub errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverStatsSnapshot {
    pub video_frames: u64,
    pub audio_frames: u64,
    pub frames_delivered: u64,
    pub frames_skipped: u64,
    pub frames_dropped: u64,
    pub errors: u64,
}

impl ReceiverStats {
    pub fn to_snapshot(&self) -> ReceiverStatsSnapshot {
        ReceiverStatsSnapshot {
            video_frames: self.video_frames.load(Ordering::Relaxed),
            audio_frames: self.audio_frames.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// One connected source on its own OS thread
pub struct NdiReceiver {
    source_name: String,
    running: Arc<AtomicBool>,
    stats: Arc<ReceiverStats>,
    thread: Option<JoinHandle<()>>,
}

impl NdiReceiver {
    /// Start receiving `source_name`. The provider moves into the thread.
    pub fn start<P: SourceProvider>(
        provider: P,
        source_name: &str,
        config: ReceiverConfig,
    ) -> Result<(Self, Receiver<ReceiverEvent>), NdiError> {
        let (tx, rx) = sync_channel(config.channel_capacity.max(1));
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(ReceiverStats::default());

        let thread = {
            let running = running.clone();
            let stats = stats.clone();
            let name = source_name.to_string();
            thread::Builder::new()
                .name("ndi-receiver".to_string())
                .spawn(move || {
                    match provider.open(&name, config.bandwidth) {
                        Ok(source) => receive_loop(source, &config, &running, &stats, &tx),
                        Err(e) => {
                            warn!("[NDI] Failed to open {}: {}", name, e);
                            stats.errors.fetch_add(1, Ordering::Relaxed);
                            let _ = tx.try_send(ReceiverEvent::Error(e.to_string()));
                        }
                    }
                    running.store(false, Ordering::SeqCst);
                    let _ = tx.try_send(ReceiverEvent::Stopped);
                    info!("[NDI] Receiver for {} stopped", name);
                })
                .map_err(|e| NdiError::Receiver(e.to_string()))?
        };

        Ok((
            Self {
                source_name: source_name.to_string(),
                running,
                stats,
                thread: Some(thread),
            },
            rx,
        ))
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ReceiverStatsSnapshot {
        self.stats.to_snapshot()
    }

    /// Clear the running flag and join, giving up after two seconds.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(thread) = self.thread.take() {
            let deadline = Instant::now() + STOP_JOIN_TIMEOUT;
            while !thread.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if thread.is_finished() {
                let _ = thread.join();
            } else {
                warn!("[NDI] Receiver thread for {} did not stop in time", self.source_name);
            }
        }
    }
}

impl Drop for NdiReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Measurements {
    window_start: Instant,
    window_frames: u32,
    fps: f64,
    bitrate: String,
    audio_level_db: f32,
    resolution: String,
}

impl Measurements {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            window_frames: 0,
            fps: 0.0,
            bitrate: format_bitrate(0.0),
            audio_level_db: SILENCE_DB,
            resolution: String::new(),
        }
    }

    fn on_video(&mut self, frame: &VideoFrame, mode: BandwidthMode) {
        let resolution = format!("{}x{}", frame.width, frame.height);
        if resolution != self.resolution {
            info!("[NDI] Resolution {}", resolution);
            self.resolution = resolution;
        }

        self.window_frames += 1;
        let elapsed = self.window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            self.fps = normalize_fps(f64::from(self.window_frames) / elapsed.as_secs_f64());
            self.window_frames = 0;
            self.window_start = Instant::now();
            debug!("[NDI] {:.1} fps ({})", self.fps, mode);
        }

        if self.fps > 0.0 {
            let mbps = estimate_mbps(frame.width, frame.height, self.fps, Some(frame.wire_size()), mode);
            self.bitrate = format_bitrate(mbps);
        }
    }
}

fn receive_loop(
    mut source: Box<dyn FrameSource + '_>,
    config: &ReceiverConfig,
    running: &AtomicBool,
    stats: &ReceiverStats,
    tx: &SyncSender<ReceiverEvent>,
) {
    info!("[NDI] Receiving {} ({} bandwidth, skip {})", source.name(), config.bandwidth, config.frame_skip);
    let timeout = config.bandwidth.capture_timeout();
    let mut measurements = Measurements::new();
    let mut sequence: u64 = 0;

    while running.load(Ordering::SeqCst) {
        match source.capture(timeout) {
            Ok(Captured::Video(frame)) => {
                stats.video_frames.fetch_add(1, Ordering::Relaxed);
                sequence += 1;
                measurements.on_video(&frame, config.bandwidth);

                if (sequence - 1) % (u64::from(config.frame_skip) + 1) != 0 {
                    stats.frames_skipped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }

                let image = match to_rgb(&frame) {
                    Ok(image) => image,
                    Err(e) => {
                        stats.errors.fetch_add(1, Ordering::Relaxed);
                        let _ = tx.try_send(ReceiverEvent::Error(e.to_string()));
                        continue;
                    }
                };

                let info = FrameInfo {
                    image,
                    resolution: measurements.resolution.clone(),
                    fps: measurements.fps,
                    bitrate: measurements.bitrate.clone(),
                    audio_level_db: measurements.audio_level_db,
                    sequence,
                };
                match tx.try_send(ReceiverEvent::Frame(info)) {
                    Ok(()) => {
                        stats.frames_delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Full(_)) => {
                        stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        debug!("[NDI] Consumer gone, stopping");
                        break;
                    }
                }
            }
            Ok(Captured::Audio(audio)) => {
                stats.audio_frames.fetch_add(1, Ordering::Relaxed);
                measurements.audio_level_db = audio_level_db(&audio.data);
            }
            Ok(Captured::Metadata(xml)) => {
                debug!("[NDI] Metadata: {}", xml);
            }
            Ok(Captured::None) => {
                if config.bandwidth == BandwidthMode::Lowest {
                    thread::sleep(PROXY_IDLE);
                }
            }
            Err(e) => {
                stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!("[NDI] Capture error on {}: {}", source.name(), e);
                let _ = tx.try_send(ReceiverEvent::Error(e.to_string()));
                thread::sleep(ERROR_BACKOFF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ndi::simulator::SimulatorContext;

    const CAMERA: &str = "Test Camera 1 (Simulated)";

    fn simulator() -> SimulatorContext {
        SimulatorContext::new().with_format(32, 18, 100)
    }

    fn frames(rx: &Receiver<ReceiverEvent>, count: usize) -> Vec<FrameInfo> {
        let mut out = Vec::new();
        while out.len() < count {
            match rx.recv_timeout(Duration::from_secs(5)).expect("no event") {
                ReceiverEvent::Frame(info) => out.push(info),
                ReceiverEvent::Error(e) => panic!("receiver error: {}", e),
                ReceiverEvent::Stopped => panic!("stopped early"),
            }
        }
        out
    }

    #[test]
    fn test_delivers_converted_frames() {
        let (mut receiver, rx) = NdiReceiver::start(simulator(), CAMERA, ReceiverConfig::default()).unwrap();
        assert_eq!(receiver.source_name(), CAMERA);

        let got = frames(&rx, 3);
        assert_eq!(got[0].resolution, "32x18");
        assert_eq!(got[0].image.data.len(), 32 * 18 * 3);
        // first bar is white
        assert_eq!(got[0].image.pixel(0, 0), Some([255, 255, 255]));
        assert!(got.windows(2).all(|w| w[1].sequence > w[0].sequence));

        receiver.stop();
        assert!(!receiver.is_running());
        let stats = receiver.stats();
        assert!(stats.frames_delivered >= 3);
        assert!(stats.audio_frames >= 1);

        // thread joined: only buffered events remain, then the channel closes
        let _: Vec<_> = rx.try_iter().collect();
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_frame_skip() {
        let config = ReceiverConfig {
            frame_skip: 2,
            channel_capacity: 16,
            ..Default::default()
        };
        let (mut receiver, rx) = NdiReceiver::start(simulator().with_audio(false), CAMERA, config).unwrap();

        let got = frames(&rx, 3);
        let sequences: Vec<u64> = got.iter().map(|f| f.sequence).collect();
        assert_eq!(sequences, vec![1, 4, 7]);

        receiver.stop();
        assert!(receiver.stats().frames_skipped >= 4);
    }

    #[test]
    fn test_fps_and_bitrate_after_one_second() {
        let config = ReceiverConfig {
            channel_capacity: 256,
            ..Default::default()
        };
        let (mut receiver, rx) = NdiReceiver::start(simulator(), CAMERA, config).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut measured = None;
        while Instant::now() < deadline {
            if let Ok(ReceiverEvent::Frame(info)) = rx.recv_timeout(Duration::from_secs(1)) {
                if info.fps > 0.0 {
                    measured = Some(info);
                    break;
                }
            }
        }
        receiver.stop();

        let info = measured.expect("fps never measured");
        assert!(info.fps > 50.0 && info.fps <= 100.0, "fps {}", info.fps);
        assert!(info.bitrate.ends_with("Mbps"));
        assert!(info.audio_level_db > -12.0);
    }

    #[test]
    fn test_unknown_source_reports_and_stops() {
        let (mut receiver, rx) = NdiReceiver::start(simulator(), "Missing", ReceiverConfig::default()).unwrap();

        assert!(matches!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), ReceiverEvent::Error(_)));
        assert!(matches!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), ReceiverEvent::Stopped));
        receiver.stop();
        assert_eq!(receiver.stats().errors, 1);
    }

    #[test]
    fn test_slow_consumer_drops_instead_of_blocking() {
        let config = ReceiverConfig {
            channel_capacity: 1,
            bandwidth: BandwidthMode::Lowest,
            ..Default::default()
        };
        let (mut receiver, rx) = NdiReceiver::start(simulator(), CAMERA, config).unwrap();

        thread::sleep(Duration::from_millis(200));
        receiver.stop();

        let stats = receiver.stats();
        assert_eq!(stats.frames_delivered, 1);
        assert!(stats.frames_dropped >= 1);
        drop(rx);
    }
}
