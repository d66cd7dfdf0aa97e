//! Display statistics: estimated NDI bitrate, normalized FPS, audio level.
//!
//! NDI does not report its wire bitrate, so it is estimated from the raw
//! 32-bit frame rate and a compression ratio per resolution and mode. The
//! normal-mode figures match published SpeedHQ bitrates; proxy figures are
//! H.264-class targets.

use super::source::BandwidthMode;

/// Floor for any estimate
const MIN_MBPS: f64 = 0.1;

/// Silence floor for [`audio_level_db`]
pub const SILENCE_DB: f32 = -60.0;

/// Raw 32-bit RGBA bitrate in Mbps
pub fn raw_mbps(width: u32, height: u32, fps: f64) -> f64 {
    f64::from(width) * f64::from(height) * 4.0 * 8.0 * fps / 1_000_000.0
}

/// Estimated wire bitrate in Mbps.
///
/// When `actual_frame_bytes` (stride × height) implies more than 80% of the
/// raw rate the source is uncompressed (same-machine NDI) and the measured
/// figure wins.
pub fn estimate_mbps(
    width: u32,
    height: u32,
    fps: f64,
    actual_frame_bytes: Option<usize>,
    mode: BandwidthMode,
) -> f64 {
    let raw = raw_mbps(width, height, fps);
    if raw <= 0.0 {
        return MIN_MBPS;
    }

    if let Some(bytes) = actual_frame_bytes {
        let actual = bytes as f64 * 8.0 * fps / 1_000_000.0;
        if actual > raw * 0.8 {
            return actual;
        }
    }

    let ratio = match mode {
        BandwidthMode::Lowest => proxy_ratio(width, height, fps, raw),
        BandwidthMode::Highest => speedhq_ratio(width, height, fps, raw),
    };
    (raw * ratio).max(MIN_MBPS)
}

fn proxy_ratio(width: u32, height: u32, fps: f64, raw: f64) -> f64 {
    let high = fps >= 60.0;
    match (width, height) {
        (640, 360) => {
            if high {
                30.0 / raw
            } else {
                15.0 / raw
            }
        }
        (w, h) if w <= 640 && h <= 360 => pick(high, 0.068, 0.034),
        (w, h) if w <= 1280 && h <= 720 => pick(high, 0.04, 0.03),
        (1920, 1080) => {
            if high {
                120.0 / raw
            } else {
                100.0 / raw
            }
        }
        (w, h) if w <= 1920 && h <= 1080 => pick(high, 0.06, 0.05),
        _ => pick(high, 0.015, 0.01),
    }
}

fn speedhq_ratio(width: u32, height: u32, fps: f64, raw: f64) -> f64 {
    // (60 fps Mbps, 50 fps Mbps, ratio below 50 fps)
    let exact = match (width, height) {
        (1280, 720) => Some((105.83, 96.94, 0.11)),
        (1920, 1080) => Some((165.17, 125.59, 0.051)),
        (3840, 2160) => Some((249.99, 223.80, 0.028)),
        _ => None,
    };

    if let Some((at_60, at_50, below)) = exact {
        return if fps >= 60.0 {
            at_60 / raw
        } else if fps >= 50.0 {
            at_50 / raw
        } else {
            below
        };
    }

    let high = fps >= 60.0;
    match (width, height) {
        (w, h) if w <= 1280 && h <= 720 => pick(high, 0.12, 0.11),
        (w, h) if w <= 1920 && h <= 1080 => pick(high, 0.066, 0.051),
        (w, h) if w <= 2560 && h <= 1440 => pick(high, 0.055, 0.045),
        (w, h) if w <= 3840 && h <= 2160 => pick(high, 0.031, 0.028),
        _ => 0.025,
    }
}

fn pick(high: bool, at_60: f64, otherwise: f64) -> f64 {
    if high {
        at_60
    } else {
        otherwise
    }
}

/// `"X.X Gbps"` from 1000 Mbps up, else `"X.X Mbps"`
pub fn format_bitrate(mbps: f64) -> String {
    if mbps >= 1000.0 {
        format!("{:.1} Gbps", mbps / 1000.0)
    } else {
        format!("{:.1} Mbps", mbps)
    }
}

/// Snap measured FPS to the nominal rate (59.94 → 60, 29.97 → 30).
pub fn normalize_fps(raw_fps: f64) -> f64 {
    if raw_fps > 59.5 {
        60.0
    } else if raw_fps > 29.5 && raw_fps <= 30.5 {
        30.0
    } else {
        (raw_fps * 10.0).round() / 10.0
    }
}

/// RMS level in dBFS, clamped to [-60, 0]
pub fn audio_level_db(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return SILENCE_DB;
    }
    let mean_square = samples.iter().map(|s| f64::from(*s) * f64::from(*s)).sum::<f64>() / samples.len() as f64;
    let rms = mean_square.sqrt();
    if rms <= 0.0 {
        return SILENCE_DB;
    }
    ((20.0 * rms.log10()) as f32).clamp(SILENCE_DB, 0.0)
}
