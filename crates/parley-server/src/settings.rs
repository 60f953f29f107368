//! Layered settings.
//!
//! Loading flow:
//! 1. Start with compiled [`Settings::default()`]
//! 2. If the settings file exists (`~/.parley/settings.json` unless a path is
//!    given), deep-merge its values over the defaults
//! 3. Apply `PARLEY_*` environment overrides (highest priority)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parley_telemetry::{parse_level, TelemetryConfig, TelemetryError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings io: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid setting: {0}")]
    Invalid(&'static str),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub server: ServerSettings,
    pub store: StoreSettings,
    pub logging: LoggingSettings,
}

/// Network and live-channel settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Path the WebSocket upgrade is served on.
    pub ws_path: String,
    pub heartbeat_interval_ms: u64,
    /// Connections silent for longer than this are swept.
    pub client_timeout_ms: u64,
    pub cleanup_interval_ms: u64,
    /// Per-connection outbound queue; frames beyond it are dropped.
    pub max_send_queue: usize,
    /// Inbound frames waiting for the dispatcher.
    pub dispatch_queue: usize,
    /// Capacity of the mutation broadcast channel.
    pub event_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9091,
            ws_path: "/ws".to_string(),
            heartbeat_interval_ms: 30_000,
            client_timeout_ms: 90_000,
            cleanup_interval_ms: 60_000,
            max_send_queue: 256,
            dispatch_queue: 1024,
            event_capacity: 1024,
        }
    }
}

impl ServerSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    /// Reject values the runtime cannot work with: zero-sized queues and
    /// intervals, and a ws path axum would refuse to route.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let checks: [(bool, &'static str); 7] = [
            (self.ws_path.starts_with('/'), "server.wsPath must start with '/'"),
            (self.heartbeat_interval_ms > 0, "server.heartbeatIntervalMs must be > 0"),
            (self.client_timeout_ms > 0, "server.clientTimeoutMs must be > 0"),
            (self.cleanup_interval_ms > 0, "server.cleanupIntervalMs must be > 0"),
            (self.max_send_queue > 0, "server.maxSendQueue must be > 0"),
            (self.dispatch_queue > 0, "server.dispatchQueue must be > 0"),
            (self.event_capacity > 0, "server.eventCapacity must be > 0"),
        ];
        match checks.into_iter().find(|(ok, _)| !ok) {
            Some((_, reason)) => Err(SettingsError::Invalid(reason)),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    pub db_path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            db_path: parley_home().join("parley.db").display().to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Per-module overrides, e.g. `{"parley_server": "debug"}`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            modules: BTreeMap::new(),
        }
    }
}

impl LoggingSettings {
    pub fn telemetry_config(&self) -> Result<TelemetryConfig, TelemetryError> {
        let module_levels = self
            .modules
            .iter()
            .map(|(module, level)| Ok((module.clone(), parse_level(level)?)))
            .collect::<Result<Vec<_>, TelemetryError>>()?;
        Ok(TelemetryConfig {
            log_level: parse_level(&self.level)?,
            module_levels,
            json: self.json,
        })
    }
}

fn parley_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".parley")
}

/// `~/.parley/settings.json`.
pub fn settings_path() -> PathBuf {
    parley_home().join("settings.json")
}

pub fn load_settings() -> Result<Settings, SettingsError> {
    load_settings_from_path(&settings_path())
}

/// Load from a specific file. A missing file yields defaults; invalid JSON
/// is an error.
pub fn load_settings_from_path(path: &Path) -> Result<Settings, SettingsError> {
    let defaults = serde_json::to_value(Settings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: Settings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.server.validate()?;
    Ok(settings)
}

/// Objects merge recursively; arrays and primitives are replaced; nulls in
/// `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

pub fn apply_env_overrides(settings: &mut Settings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from any variable source. Invalid values are ignored with
/// a warning.
pub fn apply_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("PARLEY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("PARLEY_PORT") {
        match parse_u16_range(&v, 1, 65535) {
            Some(port) => settings.server.port = port,
            None => tracing::warn!(key = "PARLEY_PORT", value = %v, "invalid port, ignoring"),
        }
    }
    if let Some(v) = read("PARLEY_WS_PATH") {
        if v.starts_with('/') {
            settings.server.ws_path = v;
        } else {
            tracing::warn!(key = "PARLEY_WS_PATH", value = %v, "path must start with '/', ignoring");
        }
    }
    if let Some(v) = read("PARLEY_DB_PATH") {
        settings.store.db_path = v;
    }
    if let Some(v) = read("PARLEY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read("PARLEY_LOG_JSON") {
        match parse_bool(&v) {
            Some(json) => settings.logging.json = json,
            None => tracing::warn!(key = "PARLEY_LOG_JSON", value = %v, "invalid boolean, ignoring"),
        }
    }
}

/// Accepts `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`, any case.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
