//! Adaptive SRT latency.
//!
//! Periodically measures round-trip time to the MediaMTX server and derives
//! an SRT latency from it: `ping * multiplier + 10% jitter`, rounded to
//! 10 ms and clamped to the preset's limits. Outlying pings are removed with
//! an IQR filter before averaging.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::http::HttpClient;

use super::mediamtx::MediaMtxEndpoint;

/// Latency used before any measurement
pub const DEFAULT_LATENCY_MS: u32 = 120;

/// Number of pings kept for averaging
const HISTORY_LEN: usize = 10;

/// Smallest latency change worth applying
const MIN_LATENCY_STEP_MS: u32 = 10;

const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Deployment distance presets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyPreset {
    Local,
    Regional,
    Global,
    Satellite,
}

/// Tuning behind a preset
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresetParams {
    pub multiplier: f64,
    pub min_latency_ms: u32,
    pub max_latency_ms: u32,
    pub check_interval: Duration,
}

impl LatencyPreset {
    pub fn params(&self) -> PresetParams {
        let (multiplier, min_latency_ms, max_latency_ms, secs) = match self {
            LatencyPreset::Local => (2.0, 20, 100, 3),
            LatencyPreset::Regional => (3.0, 50, 300, 5),
            LatencyPreset::Global => (4.0, 100, 500, 10),
            LatencyPreset::Satellite => (5.0, 200, 1000, 15),
        };
        PresetParams {
            multiplier,
            min_latency_ms,
            max_latency_ms,
            check_interval: Duration::from_secs(secs),
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "local" => Some(LatencyPreset::Local),
            "regional" => Some(LatencyPreset::Regional),
            "global" => Some(LatencyPreset::Global),
            "satellite" => Some(LatencyPreset::Satellite),
            _ => None,
        }
    }

    /// Preset suited to an average ping
    pub fn recommend(avg_ping_ms: f64) -> Self {
        if avg_ping_ms < 10.0 {
            LatencyPreset::Local
        } else if avg_ping_ms < 50.0 {
            LatencyPreset::Regional
        } else if avg_ping_ms < 150.0 {
            LatencyPreset::Global
        } else {
            LatencyPreset::Satellite
        }
    }
}

/// Coarse network quality rating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Bad,
}

impl NetworkQuality {
    pub fn from_ping(ping_ms: f64) -> Self {
        if ping_ms < 10.0 {
            NetworkQuality::Excellent
        } else if ping_ms < 30.0 {
            NetworkQuality::Good
        } else if ping_ms < 50.0 {
            NetworkQuality::Fair
        } else if ping_ms < 100.0 {
            NetworkQuality::Poor
        } else {
            NetworkQuality::Bad
        }
    }
}

impl fmt::Display for NetworkQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkQuality::Excellent => "excellent",
            NetworkQuality::Good => "good",
            NetworkQuality::Fair => "fair",
            NetworkQuality::Poor => "poor",
            NetworkQuality::Bad => "bad",
        };
        f.write_str(s)
    }
}

/// Ping history and the latency derived from it
#[derive(Debug, Clone)]
pub struct LatencyCalculator {
    history: VecDeque<f64>,
    multiplier: f64,
    min_latency_ms: u32,
    max_latency_ms: u32,
    current_latency_ms: u32,
}

impl Default for LatencyCalculator {
    fn default() -> Self {
        let mut calc = Self::new(LatencyPreset::Regional);
        calc.set_limits(20, 1000);
        calc
    }
}

impl LatencyCalculator {
    pub fn new(preset: LatencyPreset) -> Self {
        let params = preset.params();
        let mut calc = Self {
            history: VecDeque::with_capacity(HISTORY_LEN),
            multiplier: 3.0,
            min_latency_ms: 20,
            max_latency_ms: 1000,
            current_latency_ms: DEFAULT_LATENCY_MS,
        };
        calc.set_multiplier(params.multiplier);
        calc.set_limits(params.min_latency_ms, params.max_latency_ms);
        calc
    }

    /// Clamped to 1.0..=5.0
    pub fn set_multiplier(&mut self, multiplier: f64) {
        self.multiplier = multiplier.clamp(1.0, 5.0);
    }

    /// Minimum is at least 20 ms, maximum at most 2000 ms.
    pub fn set_limits(&mut self, min_ms: u32, max_ms: u32) {
        self.min_latency_ms = min_ms.max(20);
        self.max_latency_ms = max_ms.min(2000).max(self.min_latency_ms);
    }

    pub fn current_latency(&self) -> u32 {
        self.current_latency_ms
    }

    pub fn history(&self) -> impl Iterator<Item = f64> + '_ {
        self.history.iter().copied()
    }

    /// Mean of the history after IQR outlier removal.
    pub fn average_ping(&self) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }
        let samples: Vec<f64> = self.history.iter().copied().collect();
        if samples.len() < 3 {
            return mean(&samples);
        }

        let filtered = remove_outliers(&samples);
        if filtered.is_empty() {
            median(&samples)
        } else {
            mean(&filtered)
        }
    }

    /// Latency for a given ping under the current multiplier and limits
    pub fn optimal_latency(&self, ping_ms: f64) -> u32 {
        let raw = ping_ms * self.multiplier + ping_ms * 0.1;
        let rounded = ((raw / 10.0).round() * 10.0).max(0.0) as u32;
        rounded.clamp(self.min_latency_ms, self.max_latency_ms)
    }

    /// Add a measurement. Returns the new latency if it moved by at least 10 ms.
    pub fn record(&mut self, ping_ms: f64) -> Option<u32> {
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(ping_ms);

        let latency = self.optimal_latency(self.average_ping());
        if latency.abs_diff(self.current_latency_ms) >= MIN_LATENCY_STEP_MS {
            self.current_latency_ms = latency;
            Some(latency)
        } else {
            None
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Keep values within 1.5 IQR of the quartiles (q1 = n/4, q3 = 3n/4 by index).
pub fn remove_outliers(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    if n == 0 {
        return Vec::new();
    }

    let q1 = sorted[n / 4];
    let q3 = sorted[(3 * n / 4).min(n - 1)];
    let iqr = q3 - q1;
    let (lower, upper) = (q1 - 1.5 * iqr, q3 + 1.5 * iqr);

    values
        .iter()
        .copied()
        .filter(|v| (lower..=upper).contains(v))
        .collect()
}

/// Latest monitor output
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkSnapshot {
    /// Averaged ping, 0 until the first successful measurement
    pub ping_ms: f64,
    pub latency_ms: u32,
    pub quality: Option<NetworkQuality>,
}

impl Default for NetworkSnapshot {
    fn default() -> Self {
        Self {
            ping_ms: 0.0,
            latency_ms: DEFAULT_LATENCY_MS,
            quality: None,
        }
    }
}

/// Round-trip time to the MediaMTX API: HTTP first, TCP connect as fallback.
pub async fn measure_ping(http: &HttpClient, endpoint: &MediaMtxEndpoint) -> Option<f64> {
    let url = format!("{}/v3/config/global", endpoint.api_base());
    let start = Instant::now();
    match http.get(&url, PING_TIMEOUT).await {
        Ok(_) => return Some(start.elapsed().as_secs_f64() * 1000.0),
        Err(e) => debug!("[Stream] HTTP ping failed: {}", e),
    }

    let addr = format!("{}:{}", endpoint.server, endpoint.api_port);
    let start = Instant::now();
    match tokio::time::timeout(PING_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(_)) => Some(start.elapsed().as_secs_f64() * 1000.0),
        Ok(Err(e)) => {
            debug!("[Stream] TCP ping to {} failed: {}", addr, e);
            None
        }
        Err(_) => {
            debug!("[Stream] TCP ping to {} timed out", addr);
            None
        }
    }
}

/// Background ping loop feeding a [`LatencyCalculator`]
pub struct NetworkMonitor {
    snapshot: watch::Receiver<NetworkSnapshot>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl NetworkMonitor {
    /// Start measuring on the current runtime.
    pub fn spawn(endpoint: MediaMtxEndpoint, preset: LatencyPreset) -> Self {
        let (snapshot_tx, snapshot) = watch::channel(NetworkSnapshot::default());
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let interval = preset.params().check_interval;

        let task = tokio::spawn(async move {
            let http = HttpClient::new();
            let mut calc = LatencyCalculator::new(preset);
            info!("[Stream] Network monitor started ({:?} preset)", preset);

            loop {
                let wait = match measure_ping(&http, &endpoint).await {
                    Some(ping) => {
                        if let Some(latency) = calc.record(ping) {
                            info!("[Stream] SRT latency adjusted to {} ms", latency);
                        }
                        let avg = calc.average_ping();
                        let _ = snapshot_tx.send(NetworkSnapshot {
                            ping_ms: avg,
                            latency_ms: calc.current_latency(),
                            quality: Some(NetworkQuality::from_ping(avg)),
                        });
                        interval
                    }
                    None => {
                        warn!("[Stream] Could not reach {} for latency measurement", endpoint.server);
                        interval * 2
                    }
                };

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        Self {
            snapshot,
            shutdown,
            task,
        }
    }

    pub fn latest(&self) -> NetworkSnapshot {
        *self.snapshot.borrow()
    }

    /// Receiver that changes with every measurement
    pub fn subscribe(&self) -> watch::Receiver<NetworkSnapshot> {
        self.snapshot.clone()
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}
