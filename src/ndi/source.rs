//! Capture backends.
//!
//! A [`SourceProvider`] discovers sources and opens one by name; the
//! opened [`FrameSource`] is polled by the receiver thread. The SDK and
//! the simulator are interchangeable behind these traits.

use std::fmt;
use std::time::Duration;

use super::frame::{AudioFrame, VideoFrame};
use super::NdiError;

/// Receive bandwidth requested from the sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BandwidthMode {
    /// Full-quality stream
    #[default]
    Highest,
    /// Proxy stream (low resolution)
    Lowest,
}

impl BandwidthMode {
    /// Per-iteration capture timeout: 16 ms paces a 60 fps source, proxy polls
    pub fn capture_timeout(&self) -> Duration {
        match self {
            BandwidthMode::Highest => Duration::from_millis(16),
            BandwidthMode::Lowest => Duration::ZERO,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "highest" | "normal" => Some(BandwidthMode::Highest),
            "lowest" | "proxy" => Some(BandwidthMode::Lowest),
            _ => None,
        }
    }
}

impl fmt::Display for BandwidthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BandwidthMode::Highest => write!(f, "highest"),
            BandwidthMode::Lowest => write!(f, "lowest"),
        }
    }
}

/// Result of one capture call
#[derive(Debug)]
pub enum Captured {
    Video(VideoFrame),
    Audio(AudioFrame),
    Metadata(String),
    /// Timed out with nothing to deliver
    None,
}

/// An opened source
pub trait FrameSource {
    /// Wait up to `timeout` for the next frame. Returned frames are owned
    /// copies; nothing borrowed from the backend outlives this call.
    fn capture(&mut self, timeout: Duration) -> Result<Captured, NdiError>;

    fn name(&self) -> &str;
}

/// Source discovery and connection
pub trait SourceProvider: Send + 'static {
    /// Names of the sources currently visible
    fn discover(&self, timeout: Duration) -> Result<Vec<String>, NdiError>;

    /// Connect to `name`, re-resolving it against the current source list.
    fn open(&self, name: &str, bandwidth: BandwidthMode) -> Result<Box<dyn FrameSource + '_>, NdiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_timeouts() {
        assert_eq!(BandwidthMode::Highest.capture_timeout(), Duration::from_millis(16));
        assert_eq!(BandwidthMode::Lowest.capture_timeout(), Duration::ZERO);
    }

    #[test]
    fn test_mode_names() {
        assert_eq!(BandwidthMode::from_name("proxy"), Some(BandwidthMode::Lowest));
        assert_eq!(BandwidthMode::from_name("Highest"), Some(BandwidthMode::Highest));
        assert_eq!(BandwidthMode::from_name("medium"), None);
        assert_eq!(BandwidthMode::Lowest.to_string(), "lowest");
    }
}
