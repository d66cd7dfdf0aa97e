//! FFmpeg command construction for SRT publishing.
//!
//! Everything here is pure: parameters in, argv out. The supervisor owns
//! spawning and process lifetime.

use std::fmt;
use std::process::Stdio;

use log::{debug, info};
use tokio::process::Command;

use super::StreamError;

/// What FFmpeg should capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSource {
    /// An NDI source by its full name, e.g. `"STUDIO (vMix - Output 1)"`
    Ndi { name: String },
    /// The primary desktop
    Screen,
}

impl StreamSource {
    /// Parse `ndi:<name>` or `screen`.
    pub fn parse(s: &str) -> Result<Self, StreamError> {
        if s.eq_ignore_ascii_case("screen") {
            return Ok(StreamSource::Screen);
        }
        match s.strip_prefix("ndi:") {
            Some(name) if !name.is_empty() => Ok(StreamSource::Ndi {
                name: name.to_string(),
            }),
            _ => Err(StreamError::InvalidParams(format!(
                "unknown source {:?} (expected ndi:<name> or screen)",
                s
            ))),
        }
    }

    fn input_args(&self, fps: u32) -> Vec<String> {
        match self {
            StreamSource::Ndi { name } => args(&["-f", "libndi_newtek", "-i", name.as_str()]),
            StreamSource::Screen => {
                let (format, input) = screen_capture_input();
                args(&["-f", format, "-framerate", fps.to_string().as_str(), "-i", input])
            }
        }
    }

    fn has_audio(&self) -> bool {
        matches!(self, StreamSource::Ndi { .. })
    }
}

impl fmt::Display for StreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamSource::Ndi { name } => write!(f, "NDI {}", name),
            StreamSource::Screen => write!(f, "screen"),
        }
    }
}

/// Screen grabber device and input for this platform
fn screen_capture_input() -> (&'static str, &'static str) {
    if cfg!(target_os = "windows") {
        ("gdigrab", "desktop")
    } else if cfg!(target_os = "macos") {
        ("avfoundation", "1:0")
    } else {
        ("x11grab", ":0.0")
    }
}

/// H.264 encoder and its low-latency settings. No profile emits B-frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderProfile {
    /// Software x264
    X264 { preset: String, tune: String },
    /// NVIDIA NVENC
    Nvenc,
    /// Intel Quick Sync
    Qsv,
    /// AMD AMF
    Amf,
    /// Apple VideoToolbox
    VideoToolbox,
}

impl Default for EncoderProfile {
    fn default() -> Self {
        EncoderProfile::X264 {
            preset: "ultrafast".to_string(),
            tune: "zerolatency".to_string(),
        }
    }
}

impl EncoderProfile {
    /// FFmpeg encoder name
    pub fn codec(&self) -> &'static str {
        match self {
            EncoderProfile::X264 { .. } => "libx264",
            EncoderProfile::Nvenc => "h264_nvenc",
            EncoderProfile::Qsv => "h264_qsv",
            EncoderProfile::Amf => "h264_amf",
            EncoderProfile::VideoToolbox => "h264_videotoolbox",
        }
    }

    /// Accepts short names (`x264`, `nvenc`, ...) or FFmpeg encoder names.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "x264" | "libx264" | "software" => Some(Self::default()),
            "nvenc" | "h264_nvenc" => Some(EncoderProfile::Nvenc),
            "qsv" | "h264_qsv" => Some(EncoderProfile::Qsv),
            "amf" | "h264_amf" => Some(EncoderProfile::Amf),
            "videotoolbox" | "h264_videotoolbox" => Some(EncoderProfile::VideoToolbox),
            _ => None,
        }
    }

    /// Hardware encoders in preference order
    pub fn hardware() -> [EncoderProfile; 4] {
        [
            EncoderProfile::Nvenc,
            EncoderProfile::Qsv,
            EncoderProfile::Amf,
            EncoderProfile::VideoToolbox,
        ]
    }

    fn args(&self) -> Vec<String> {
        match self {
            EncoderProfile::X264 { preset, tune } => {
                let mut out = args(&["-preset", preset.as_str(), "-profile:v", "main", "-tune", tune.as_str()]);
                out.extend(args(&[
                    "-x264-params",
                    "nal-hrd=cbr:no-mbtree:bframes=0:threads=auto:sliced-threads",
                ]));
                out
            }
            EncoderProfile::Nvenc => args(&[
                "-preset", "p4", "-tune", "ll", "-zerolatency", "1", "-rc", "cbr",
                "-rc-lookahead", "0", "-no-scenecut", "1", "-forced-idr", "1",
                "-level", "4.1", "-bf", "0",
            ]),
            EncoderProfile::Qsv => args(&[
                "-preset", "veryfast", "-look_ahead", "0", "-look_ahead_depth", "0",
                "-bf", "0", "-refs", "1",
            ]),
            EncoderProfile::Amf => args(&["-usage", "ultralowlatency", "-bf", "0"]),
            EncoderProfile::VideoToolbox => args(&["-realtime", "1", "-bf", "0"]),
        }
    }
}

/// How the SRT receive latency is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyMode {
    /// Fixed latency in milliseconds
    Manual(u32),
    /// Follow the network monitor
    Adaptive,
}

/// Operator-chosen stream parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    pub source: StreamSource,
    pub bitrate_kbps: u32,
    pub fps: u32,
    pub keyframe_interval_secs: u32,
    pub encoder: EncoderProfile,
    pub latency: LatencyMode,
}

impl StreamParams {
    pub fn new(source: StreamSource) -> Self {
        Self {
            source,
            bitrate_kbps: 2000,
            fps: 30,
            keyframe_interval_secs: 2,
            encoder: EncoderProfile::default(),
            latency: LatencyMode::Adaptive,
        }
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        if self.bitrate_kbps == 0 {
            return Err(StreamError::InvalidParams("bitrate must be positive".to_string()));
        }
        if self.fps == 0 || self.fps > 240 {
            return Err(StreamError::InvalidParams(format!("unsupported frame rate {}", self.fps)));
        }
        if self.keyframe_interval_secs == 0 {
            return Err(StreamError::InvalidParams("keyframe interval must be positive".to_string()));
        }
        Ok(())
    }
}

/// Parse FFmpeg-style bitrate shorthand into kbps.
///
/// `"2M"` = 2000, `"2500k"` = 2500, a bare number is taken as kbps.
pub fn parse_bitrate(s: &str) -> Result<u32, StreamError> {
    let s = s.trim();
    let invalid = || StreamError::InvalidParams(format!("invalid bitrate {:?}", s));

    let (number, scale) = match s.chars().last() {
        Some('M') | Some('m') => (&s[..s.len() - 1], 1000.0),
        Some('K') | Some('k') => (&s[..s.len() - 1], 1.0),
        _ => (s, 1.0),
    };

    let value: f64 = number.trim().parse().map_err(|_| invalid())?;
    let kbps = (value * scale).round();
    if !(1.0..=u32::MAX as f64).contains(&kbps) {
        return Err(invalid());
    }
    Ok(kbps as u32)
}

/// VBV buffer: twice the bitrate, kept within 1..20 Mbit
pub fn buffer_size_kbps(bitrate_kbps: u32) -> u32 {
    bitrate_kbps.saturating_mul(2).clamp(1000, 20_000)
}

/// Full FFmpeg argv (without the program name).
///
/// `latency_ms` is appended to the SRT URL in microseconds, which is the
/// unit libsrt expects.
pub fn build_args(params: &StreamParams, srt_url: &str, latency_ms: u32) -> Vec<String> {
    let bitrate = format!("{}k", params.bitrate_kbps);
    let gop = params.fps.saturating_mul(params.keyframe_interval_secs);

    let mut out = args(&["-hide_banner", "-loglevel", "info"]);
    out.extend(params.source.input_args(params.fps));

    out.extend(args(&["-c:v", params.encoder.codec()]));
    out.extend(params.encoder.args());
    out.extend(args(&[
        "-b:v", bitrate.as_str(),
        "-maxrate", bitrate.as_str(),
        "-bufsize", format!("{}k", buffer_size_kbps(params.bitrate_kbps)).as_str(),
        "-g", gop.to_string().as_str(),
        "-r", params.fps.to_string().as_str(),
        "-pix_fmt", "yuv420p",
    ]));

    if params.source.has_audio() {
        out.extend(args(&["-c:a", "aac", "-b:a", "128k", "-ar", "48000", "-ac", "2"]));
    } else {
        out.push("-an".to_string());
    }

    out.extend(args(&["-f", "mpegts"]));
    out.push(format!("{}&latency={}", srt_url, u64::from(latency_ms) * 1000));
    out
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// True if `ffmpeg -version` runs successfully.
pub async fn ffmpeg_available(ffmpeg: &str) -> bool {
    let status = Command::new(ffmpeg)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    matches!(status, Ok(s) if s.success())
}

/// Encoders this FFmpeg build offers, hardware first, x264 always last.
pub async fn detect_encoders(ffmpeg: &str) -> Result<Vec<EncoderProfile>, StreamError> {
    let output = Command::new(ffmpeg)
        .args(["-hide_banner", "-encoders"])
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| StreamError::Spawn(format!("{}: {}", ffmpeg, e)))?;

    let listing = String::from_utf8_lossy(&output.stdout);
    let found = encoders_in_listing(&listing);
    info!(
        "[Stream] Available encoders: {}",
        found.iter().map(|e| e.codec()).collect::<Vec<_>>().join(", ")
    );
    Ok(found)
}

fn encoders_in_listing(listing: &str) -> Vec<EncoderProfile> {
    let names: Vec<&str> = listing
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .collect();

    let mut found: Vec<EncoderProfile> = EncoderProfile::hardware()
        .into_iter()
        .filter(|e| names.contains(&e.codec()))
        .collect();
    debug!("[Stream] Hardware encoders listed: {}", found.len());
    found.push(EncoderProfile::default());
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_after<'a>(argv: &'a [String], flag: &str) -> &'a str {
        let pos = argv.iter().position(|a| a == flag).unwrap_or_else(|| panic!("{} missing", flag));
        &argv[pos + 1]
    }

    #[test]
    fn test_ndi_x264_command() {
        let params = StreamParams {
            bitrate_kbps: 3000,
            fps: 60,
            ..StreamParams::new(StreamSource::Ndi {
                name: "STUDIO (Cam 1)".to_string(),
            })
        };
        let argv = build_args(&params, "srt://returnfeed.net:8890?streamid=publish:x&pkt_size=1316", 120);

        assert_eq!(value_after(&argv, "-f"), "libndi_newtek");
        assert_eq!(value_after(&argv, "-i"), "STUDIO (Cam 1)");
        assert_eq!(value_after(&argv, "-c:v"), "libx264");
        assert_eq!(value_after(&argv, "-preset"), "ultrafast");
        assert_eq!(value_after(&argv, "-tune"), "zerolatency");
        assert_eq!(value_after(&argv, "-b:v"), "3000k");
        assert_eq!(value_after(&argv, "-maxrate"), "3000k");
        assert_eq!(value_after(&argv, "-bufsize"), "6000k");
        assert_eq!(value_after(&argv, "-g"), "120");
        assert_eq!(value_after(&argv, "-r"), "60");
        assert_eq!(value_after(&argv, "-c:a"), "aac");
        assert!(value_after(&argv, "-x264-params").contains("bframes=0"));
        assert_eq!(
            argv.last().unwrap(),
            "srt://returnfeed.net:8890?streamid=publish:x&pkt_size=1316&latency=120000"
        );
    }

    #[test]
    fn test_screen_command_has_no_audio() {
        let params = StreamParams {
            encoder: EncoderProfile::Nvenc,
            ..StreamParams::new(StreamSource::Screen)
        };
        let argv = build_args(&params, "srt://h:1?streamid=publish:s", 200);

        assert_eq!(value_after(&argv, "-framerate"), "30");
        assert_eq!(value_after(&argv, "-c:v"), "h264_nvenc");
        assert_eq!(value_after(&argv, "-bf"), "0");
        assert!(argv.contains(&"-an".to_string()));
        assert!(!argv.contains(&"-c:a".to_string()));
    }

    #[test]
    fn test_every_profile_disables_b_frames() {
        for encoder in EncoderProfile::hardware() {
            let argv = encoder.args();
            assert_eq!(value_after(&argv, "-bf"), "0", "{}", encoder.codec());
        }
    }

    #[test]
    fn test_buffer_size_clamped() {
        assert_eq!(buffer_size_kbps(300), 1000);
        assert_eq!(buffer_size_kbps(4000), 8000);
        assert_eq!(buffer_size_kbps(15_000), 20_000);
    }

    #[test]
    fn test_parse_bitrate() {
        assert_eq!(parse_bitrate("2M").unwrap(), 2000);
        assert_eq!(parse_bitrate("1.5M").unwrap(), 1500);
        assert_eq!(parse_bitrate("2500k").unwrap(), 2500);
        assert_eq!(parse_bitrate(" 800 ").unwrap(), 800);
        assert!(parse_bitrate("fast").is_err());
        assert!(parse_bitrate("0k").is_err());
    }

    #[test]
    fn test_source_parse() {
        assert_eq!(StreamSource::parse("screen").unwrap(), StreamSource::Screen);
        assert_eq!(
            StreamSource::parse("ndi:HOST (Out)").unwrap(),
            StreamSource::Ndi { name: "HOST (Out)".to_string() }
        );
        assert!(StreamSource::parse("ndi:").is_err());
        assert!(StreamSource::parse("webcam").is_err());
    }

    #[test]
    fn test_encoder_names() {
        assert_eq!(EncoderProfile::from_name("NVENC"), Some(EncoderProfile::Nvenc));
        assert_eq!(EncoderProfile::from_name("libx264"), Some(EncoderProfile::default()));
        assert_eq!(EncoderProfile::from_name("hevc"), None);
    }

    #[test]
    fn test_encoders_in_listing() {
        let listing = "Encoders:\n V..... = Video\n ------\n V....D libx264              libx264 H.264\n V....D h264_nvenc           NVIDIA NVENC H.264 encoder\n V....D h264_qsv             H.264 (Intel Quick Sync Video acceleration)\n";
        let found = encoders_in_listing(listing);
        assert_eq!(found, vec![EncoderProfile::Nvenc, EncoderProfile::Qsv, EncoderProfile::default()]);
    }

    #[test]
    fn test_validate() {
        let mut params = StreamParams::new(StreamSource::Screen);
        assert!(params.validate().is_ok());
        params.fps = 0;
        assert!(params.validate().is_err());
    }
}
