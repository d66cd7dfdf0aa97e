//! Persistent JSON settings.
//!
//! Settings live in a single file (default `config/settings.json`). Loading
//! deep-merges the file onto the built-in defaults, so keys added in newer
//! versions appear automatically while user values win. Saving always
//! rewrites the whole file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Default settings file location (relative to the working directory)
pub const DEFAULT_SETTINGS_PATH: &str = "config/settings.json";

/// Errors that can occur while loading or saving settings
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to access settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid settings JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid settings key: {0}")]
    InvalidKey(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub version: String,
    pub auto_update: bool,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            auto_update: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Relay WebSocket URL (empty disables the relay)
    pub websocket_url: String,
    pub media_mtx_server: String,
    pub media_mtx_srt_port: u16,
    pub media_mtx_api_port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            websocket_url: "wss://returnfeed.net/ws/".to_string(),
            media_mtx_server: "returnfeed.net".to_string(),
            media_mtx_srt_port: 8890,
            media_mtx_api_port: 9997,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmixSection {
    pub default_ip: String,
    pub default_http_port: u16,
    pub default_tcp_port: u16,
}

impl Default for VmixSection {
    fn default() -> Self {
        Self {
            default_ip: "127.0.0.1".to_string(),
            default_http_port: 8088,
            default_tcp_port: 8099,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingSection {
    /// Bitrate as FFmpeg shorthand, e.g. "2M" or "2500k"
    pub default_bitrate: String,
    pub default_fps: u32,
    pub preset: String,
    pub tune: String,
}

impl Default for StreamingSection {
    fn default() -> Self {
        Self {
            default_bitrate: "2M".to_string(),
            default_fps: 30,
            preset: "ultrafast".to_string(),
            tune: "zerolatency".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiSection {
    pub theme: String,
    pub window_geometry: Option<Value>,
    pub last_tab: u32,
}

impl Default for UiSection {
    fn default() -> Self {
        Self {
            theme: "default".to_string(),
            window_geometry: None,
            last_tab: 0,
        }
    }
}

/// Tally bridge timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TallySection {
    pub debounce_ms: u64,
    pub reconnect_delay_secs: u64,
    pub fetch_timeout_ms: u64,
    pub api_path: String,
}

impl Default for TallySection {
    fn default() -> Self {
        Self {
            debounce_ms: 50,
            reconnect_delay_secs: 5,
            fetch_timeout_ms: 500,
            api_path: "/api".to_string(),
        }
    }
}

impl TallySection {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// Fetch timeout, capped at one second
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms.clamp(1, 1000))
    }
}

/// SRT latency behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    /// One of "local", "regional", "global", "satellite"
    pub latency_preset: String,
    pub adaptive_latency: bool,
    pub manual_latency_ms: u32,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            latency_preset: "regional".to_string(),
            adaptive_latency: true,
            manual_latency_ms: 120,
        }
    }
}

/// Complete application settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub app: AppSection,
    pub server: ServerSection,
    pub vmix: VmixSection,
    pub streaming: StreamingSection,
    pub ui: UiSection,
    pub tally: TallySection,
    pub network: NetworkSection,
}

/// Recursively merge `overlay` into `base`.
///
/// Objects merge key by key; any other value in `overlay` replaces the one
/// in `base`.
pub fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_json(existing, value);
                    }
                    _ => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Settings bound to a file on disk.
///
/// The raw JSON tree is kept alongside the typed view so unknown keys
/// survive a load/save cycle.
pub struct SettingsStore {
    path: PathBuf,
    raw: Value,
    settings: Settings,
}

impl SettingsStore {
    /// Load settings from `path`, writing defaults if the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let mut raw = serde_json::to_value(Settings::default())?;

        if path.exists() {
            let text = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            let loaded: Value = serde_json::from_str(&text)?;
            merge_json(&mut raw, loaded);
            info!("[Config] Loaded settings from {}", path.display());
        } else {
            info!("[Config] {} not found, writing defaults", path.display());
        }

        let settings: Settings = serde_json::from_value(raw.clone())?;
        let store = Self { path, raw, settings };

        if !store.path.exists() {
            store.save()?;
        }

        Ok(store)
    }

    /// Settings file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Typed view of the current settings
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Overwrite the settings file with the current values.
    pub fn save(&self) -> Result<(), ConfigError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let text = to_pretty_json(&self.raw)?;
        fs::write(&self.path, text).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }

    /// Look up a dotted key such as `"vmix.default_ip"`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        key.split('.')
            .try_fold(&self.raw, |node, part| node.as_object()?.get(part))
    }

    /// Set a dotted key and save immediately.
    ///
    /// Intermediate objects are created as needed. The change is rejected
    /// (and nothing is written) if it no longer deserializes into [`Settings`].
    pub fn set(&mut self, key: &str, value: Value) -> Result<(), ConfigError> {
        let parts: Vec<&str> = key.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(ConfigError::InvalidKey(key.to_string()));
        }

        let mut raw = self.raw.clone();
        let (last, parents) = parts
            .split_last()
            .ok_or_else(|| ConfigError::InvalidKey(key.to_string()))?;

        let mut node = &mut raw;
        for part in parents {
            let map = node
                .as_object_mut()
                .ok_or_else(|| ConfigError::InvalidKey(key.to_string()))?;
            node = map
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        node.as_object_mut()
            .ok_or_else(|| ConfigError::InvalidKey(key.to_string()))?
            .insert(last.to_string(), value);

        let settings: Settings = serde_json::from_value(raw.clone())?;
        self.raw = raw;
        self.settings = settings;

        if let Err(e) = self.save() {
            warn!("[Config] Failed to save after setting {}: {}", key, e);
            return Err(e);
        }
        Ok(())
    }
}

/// Serialize with a 4-space indent.
fn to_pretty_json(value: &Value) -> Result<String, ConfigError> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut ser)?;
    Ok(String::from_utf8_lossy(&out).to_string())
}

#[cfg(test)]
pub(crate) fn temp_dir(tag: &str) -> PathBuf {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let dir = std::env::temp_dir().join(format!(
        "returnfeed-{}-{}-{}",
        tag,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let _ = fs::remove_dir_all(&dir);
    dir
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_file_writes_defaults() {
        let dir = temp_dir("config-missing");
        let path = dir.join("config").join("settings.json");

        let store = SettingsStore::load(&path).unwrap();
        assert_eq!(store.settings(), &Settings::default());
        assert!(path.exists());

        let written: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["vmix"]["default_tcp_port"], 8099);
        assert_eq!(written["server"]["media_mtx_srt_port"], 8890);
    }

    #[test]
    fn test_load_merges_onto_defaults() {
        let dir = temp_dir("config-merge");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        fs::write(
            &path,
            r#"{"vmix": {"default_ip": "10.0.0.5"}, "extra": {"kept": true}}"#,
        )
        .unwrap();

        let store = SettingsStore::load(&path).unwrap();
        assert_eq!(store.settings().vmix.default_ip, "10.0.0.5");
        // Sibling keys in the same section still come from defaults
        assert_eq!(store.settings().vmix.default_http_port, 8088);
        assert_eq!(store.settings().tally.debounce_ms, 50);
        assert_eq!(store.get("extra.kept"), Some(&json!(true)));
    }

    #[test]
    fn test_set_saves_immediately() {
        let dir = temp_dir("config-set");
        let path = dir.join("settings.json");

        let mut store = SettingsStore::load(&path).unwrap();
        store.set("streaming.default_fps", json!(60)).unwrap();
        assert_eq!(store.settings().streaming.default_fps, 60);

        let reloaded = SettingsStore::load(&path).unwrap();
        assert_eq!(reloaded.settings().streaming.default_fps, 60);
        assert_eq!(reloaded.get("streaming.default_fps"), Some(&json!(60)));
    }

    #[test]
    fn test_set_rejects_wrong_type() {
        let dir = temp_dir("config-reject");
        let path = dir.join("settings.json");

        let mut store = SettingsStore::load(&path).unwrap();
        assert!(store.set("vmix.default_tcp_port", json!("not a port")).is_err());
        assert_eq!(store.settings().vmix.default_tcp_port, 8099);
        assert!(matches!(store.set("vmix..x", json!(1)), Err(ConfigError::InvalidKey(_))));
    }

    #[test]
    fn test_saved_file_uses_four_space_indent() {
        let dir = temp_dir("config-indent");
        let path = dir.join("settings.json");
        SettingsStore::load(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\n    \"app\": {"));
    }

    #[test]
    fn test_merge_replaces_scalars_and_arrays() {
        let mut base = json!({"a": {"b": 1, "c": [1, 2]}, "d": "x"});
        merge_json(&mut base, json!({"a": {"c": [3]}, "d": {"nested": true}}));
        assert_eq!(base, json!({"a": {"b": 1, "c": [3]}, "d": {"nested": true}}));
    }

    #[test]
    fn test_fetch_timeout_is_capped() {
        let tally = TallySection {
            fetch_timeout_ms: 5000,
            ..Default::default()
        };
        assert_eq!(tally.fetch_timeout(), Duration::from_secs(1));
    }
}
