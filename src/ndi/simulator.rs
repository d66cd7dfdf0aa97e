//! Software NDI stand-in for machines without the runtime.
//!
//! A [`SimulatorContext`] is an ordinary value: whoever builds the receiver
//! owns it, and cloning shares the same virtual source list.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::info;
use parking_lot::Mutex;

use super::frame::{AudioFrame, VideoFrame};
use super::source::{BandwidthMode, Captured, FrameSource, SourceProvider};
use super::NdiError;

const DEFAULT_SOURCES: [&str; 3] = [
    "Test Camera 1 (Simulated)",
    "Test Camera 2 (Simulated)",
    "Screen Capture (Simulated)",
];

const AUDIO_RATE: u32 = 48_000;
const TONE_HZ: f32 = 1000.0;

/// Virtual source list plus output format
#[derive(Clone)]
pub struct SimulatorContext {
    sources: Arc<Mutex<Vec<String>>>,
    width: u32,
    height: u32,
    fps: u32,
    audio: bool,
}

impl Default for SimulatorContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatorContext {
    /// Three virtual sources producing 1080p30 colour bars with a tone
    pub fn new() -> Self {
        Self {
            sources: Arc::new(Mutex::new(DEFAULT_SOURCES.iter().map(|s| s.to_string()).collect())),
            width: 1920,
            height: 1080,
            fps: 30,
            audio: true,
        }
    }

    pub fn with_format(mut self, width: u32, height: u32, fps: u32) -> Self {
        self.width = width;
        self.height = height;
        self.fps = fps.max(1);
        self
    }

    pub fn with_audio(mut self, audio: bool) -> Self {
        self.audio = audio;
        self
    }

    pub fn add_source(&self, name: impl Into<String>) {
        let name = name.into();
        let mut sources = self.sources.lock();
        if !sources.contains(&name) {
            info!("[NDI] Simulated source appeared: {}", name);
            sources.push(name);
        }
    }

    pub fn remove_source(&self, name: &str) -> bool {
        let mut sources = self.sources.lock();
        let before = sources.len();
        sources.retain(|s| s != name);
        sources.len() != before
    }
}

impl SourceProvider for SimulatorContext {
    fn discover(&self, _timeout: Duration) -> Result<Vec<String>, NdiError> {
        Ok(self.sources.lock().clone())
    }

    fn open(&self, name: &str, bandwidth: BandwidthMode) -> Result<Box<dyn FrameSource + '_>, NdiError> {
        if !self.sources.lock().iter().any(|s| s == name) {
            return Err(NdiError::SourceNotFound(name.to_string()));
        }

        // proxy streams are quarter resolution
        let (width, height) = match bandwidth {
            BandwidthMode::Highest => (self.width, self.height),
            BandwidthMode::Lowest => ((self.width / 2).max(1), (self.height / 2).max(1)),
        };
        info!("[NDI] Simulator connected to {} ({}x{} @ {} fps)", name, width, height, self.fps);

        let mut frame = VideoFrame::test_pattern_bars(width, height);
        frame.frame_rate_n = self.fps;
        frame.frame_rate_d = 1;

        Ok(Box::new(SimulatedSource {
            name: name.to_string(),
            frame,
            interval: Duration::from_secs(1) / self.fps,
            next_due: Instant::now(),
            audio: self.audio.then(|| tone(AUDIO_RATE / self.fps)),
            audio_pending: false,
        }))
    }
}

/// One open virtual source
pub struct SimulatedSource {
    name: String,
    frame: VideoFrame,
    interval: Duration,
    next_due: Instant,
    audio: Option<AudioFrame>,
    audio_pending: bool,
}

impl FrameSource for SimulatedSource {
    fn capture(&mut self, timeout: Duration) -> Result<Captured, NdiError> {
        if self.audio_pending {
            self.audio_pending = false;
            if let Some(audio) = &self.audio {
                return Ok(Captured::Audio(audio.clone()));
            }
        }

        let now = Instant::now();
        let wait = self.next_due.saturating_duration_since(now);
        if wait > timeout {
            std::thread::sleep(timeout);
            return Ok(Captured::None);
        }

        std::thread::sleep(wait);
        self.next_due = self.next_due.max(now) + self.interval;
        self.audio_pending = self.audio.is_some();
        Ok(Captured::Video(self.frame.clone()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Stereo 1 kHz sine at half scale
fn tone(samples_per_channel: u32) -> AudioFrame {
    let mut frame = AudioFrame::new(AUDIO_RATE, 2, samples_per_channel);
    for (i, pair) in frame.data.chunks_exact_mut(2).enumerate() {
        let t = i as f32 / AUDIO_RATE as f32;
        let s = 0.5 * (2.0 * std::f32::consts::PI * TONE_HZ * t).sin();
        pair[0] = s;
        pair[1] = s;
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ndi::bitrate::audio_level_db;

    fn small() -> SimulatorContext {
        SimulatorContext::new().with_format(64, 36, 50)
    }

    #[test]
    fn test_discover_and_shared_list() {
        let ctx = small();
        assert_eq!(ctx.discover(Duration::ZERO).unwrap().len(), 3);

        let clone = ctx.clone();
        clone.add_source("Studio Cam");
        clone.add_source("Studio Cam");
        assert!(ctx.discover(Duration::ZERO).unwrap().contains(&"Studio Cam".to_string()));
        assert_eq!(ctx.discover(Duration::ZERO).unwrap().len(), 4);

        assert!(ctx.remove_source("Studio Cam"));
        assert!(!ctx.remove_source("Studio Cam"));
    }

    #[test]
    fn test_open_unknown_source() {
        let ctx = small();
        let err = ctx.open("Nope", BandwidthMode::Highest).err().unwrap();
        assert!(matches!(err, NdiError::SourceNotFound(name) if name == "Nope"));
    }

    #[test]
    fn test_video_then_audio() {
        let ctx = small();
        let mut source = ctx.open(DEFAULT_SOURCES[0], BandwidthMode::Highest).unwrap();
        assert_eq!(source.name(), DEFAULT_SOURCES[0]);

        match source.capture(Duration::from_millis(100)).unwrap() {
            Captured::Video(frame) => {
                assert_eq!((frame.width, frame.height), (64, 36));
                assert_eq!(frame.frame_rate(), 50.0);
            }
            other => panic!("expected video, got {:?}", other),
        }
        match source.capture(Duration::ZERO).unwrap() {
            Captured::Audio(audio) => {
                assert_eq!(audio.samples_per_channel, 960);
                let level = audio_level_db(&audio.data);
                assert!((level + 9.03).abs() < 0.2, "level {}", level);
            }
            other => panic!("expected audio, got {:?}", other),
        }
        // next frame is 20 ms away
        assert!(matches!(source.capture(Duration::ZERO).unwrap(), Captured::None));
    }

    #[test]
    fn test_proxy_is_quarter_resolution() {
        let ctx = small().with_audio(false);
        let mut source = ctx.open(DEFAULT_SOURCES[2], BandwidthMode::Lowest).unwrap();
        match source.capture(Duration::from_millis(100)).unwrap() {
            Captured::Video(frame) => assert_eq!((frame.width, frame.height), (32, 18)),
            other => panic!("expected video, got {:?}", other),
        }
        assert!(matches!(source.capture(Duration::ZERO).unwrap(), Captured::None));
    }
}
