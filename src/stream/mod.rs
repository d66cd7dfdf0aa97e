//! SRT publishing through FFmpeg to a MediaMTX server.
//!
//! ```text
//! NetworkMonitor --latency--> StreamSupervisor --spawn--> ffmpeg --SRT--> MediaMTX
//!                                    ^                      |
//!                                    +------ stderr --------+
//! ```

pub mod ffmpeg;
pub mod latency;
pub mod mediamtx;
pub mod progress;
pub mod supervisor;

use thiserror::Error;

pub use ffmpeg::{build_args, parse_bitrate, EncoderProfile, LatencyMode, StreamParams, StreamSource};
pub use latency::{LatencyCalculator, LatencyPreset, NetworkMonitor, NetworkQuality, NetworkSnapshot};
pub use mediamtx::{generate_stream_key, generate_unique_address, MediaMtxClient, MediaMtxEndpoint, PathInfo};
pub use progress::{ProgressSample, StreamStats};
pub use supervisor::{SessionInfo, StreamEvent, StreamSupervisor};

/// Streaming errors
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Invalid stream parameters: {0}")]
    InvalidParams(String),

    #[error("Failed to start FFmpeg: {0}")]
    Spawn(String),

    #[error("MediaMTX API error: {0}")]
    Api(String),
}
