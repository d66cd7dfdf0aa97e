//! FFmpeg stderr progress parsing.
//!
//! FFmpeg rewrites its progress line in place with `\r`, so stderr is split
//! on both `\r` and `\n`. Values are located by substring search on their
//! `key=` prefix; FFmpeg pads numbers with spaces after the `=`.

/// One parsed `frame=... fps=... bitrate=...` line
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressSample {
    pub frame: u64,
    pub fps: f32,
    /// `None` while FFmpeg reports `N/A`
    pub bitrate_kbps: Option<f64>,
    /// Output timestamp as printed, e.g. `00:01:02.40`
    pub time: String,
    pub speed: Option<f32>,
    pub duplicated: u64,
    pub dropped: u64,
}

/// Running statistics for the UI / daemon to poll
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamStats {
    pub frames: u64,
    pub fps: f32,
    pub bitrate_kbps: Option<f64>,
    pub time: String,
    pub speed: Option<f32>,
    pub dropped: u64,
    pub duplicated: u64,
    /// Number of progress lines seen
    pub updates: u64,
    /// Most recent stderr line mentioning an error
    pub last_error: Option<String>,
    /// SRT latency the session was started with
    pub latency_ms: u32,
}

impl StreamStats {
    pub fn apply(&mut self, sample: &ProgressSample) {
        self.frames = sample.frame;
        self.fps = sample.fps;
        self.bitrate_kbps = sample.bitrate_kbps;
        self.time = sample.time.clone();
        self.speed = sample.speed;
        self.dropped = sample.dropped;
        self.duplicated = sample.duplicated;
        self.updates += 1;
    }
}

/// Value following `key` up to the next whitespace
fn field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let start = line.find(key)? + key.len();
    line[start..].trim_start().split_whitespace().next()
}

/// Parse a progress line. Returns `None` for any other stderr output.
pub fn parse_progress(line: &str) -> Option<ProgressSample> {
    if !line.contains("frame=") {
        return None;
    }

    let frame = field(line, "frame=")?.parse().ok()?;
    let fps = field(line, "fps=").and_then(|v| v.parse().ok()).unwrap_or(0.0);
    let bitrate_kbps = field(line, "bitrate=")
        .and_then(|v| v.trim_end_matches("kbits/s").parse().ok());
    let time = field(line, "time=").unwrap_or_default().to_string();
    let speed = field(line, "speed=").and_then(|v| v.trim_end_matches('x').parse().ok());
    let duplicated = field(line, "dup=").and_then(|v| v.parse().ok()).unwrap_or(0);
    let dropped = field(line, "drop=").and_then(|v| v.parse().ok()).unwrap_or(0);

    Some(ProgressSample {
        frame,
        fps,
        bitrate_kbps,
        time,
        speed,
        duplicated,
        dropped,
    })
}

/// Lines FFmpeg uses to report failures
pub fn is_error_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    ["error", "failed", "failure", "connection refused"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Splits a byte stream on `\r` and `\n`, dropping empty lines.
#[derive(Debug, Default)]
pub struct ProgressSplitter {
    pending: Vec<u8>,
}

impl ProgressSplitter {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\r' || byte == b'\n' {
                if !self.pending.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.pending).trim().to_string());
                    self.pending.clear();
                }
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// Whatever is left once the stream ends
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        Some(line)
    }
}
