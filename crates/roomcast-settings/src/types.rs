//! Settings types.
//!
//! Every struct deserializes with `#[serde(default)]`, so a settings file
//! only needs the keys it overrides.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings for a roomcast node.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoomcastSettings {
    /// HTTP/WebSocket listener settings.
    pub server: ServerSettings,
    /// Pub/sub backbone settings.
    pub backbone: BackboneSettings,
    /// Heartbeat and write-timeout settings.
    pub liveness: LivenessSettings,
    /// Shutdown settings.
    pub shutdown: ShutdownSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

impl RoomcastSettings {
    /// Reject values that would make the node misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.server.ws_path.is_empty() || !self.server.ws_path.starts_with('/') {
            return Err(SettingsError::invalid(
                "server.wsPath",
                format!("must start with '/': {:?}", self.server.ws_path),
            ));
        }
        let liveness = &self.liveness;
        if liveness.ping_interval_ms == 0 {
            return Err(SettingsError::invalid("liveness.pingIntervalMs", "must be > 0"));
        }
        if liveness.pong_timeout_ms == 0 {
            return Err(SettingsError::invalid("liveness.pongTimeoutMs", "must be > 0"));
        }
        // The idle limit has to outlast at least one probe interval.
        if liveness.pong_timeout_ms <= liveness.ping_interval_ms {
            return Err(SettingsError::invalid(
                "liveness.pongTimeoutMs",
                format!(
                    "must exceed liveness.pingIntervalMs ({} <= {})",
                    liveness.pong_timeout_ms, liveness.ping_interval_ms
                ),
            ));
        }
        if liveness.write_timeout_ms == 0 {
            return Err(SettingsError::invalid("liveness.writeTimeoutMs", "must be > 0"));
        }
        if self.backbone.kind == BackboneKind::Redis && self.backbone.url.is_empty() {
            return Err(SettingsError::invalid(
                "backbone.url",
                "required for the redis backbone",
            ));
        }
        Ok(())
    }
}

/// Listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// Path of the WebSocket upgrade endpoint.
    pub ws_path: String,
    /// Largest accepted inbound frame in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            ws_path: "/ws".to_string(),
            max_message_size: 1024 * 1024,
        }
    }
}

/// Which backbone implementation a node connects to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackboneKind {
    /// In-process bus; only useful for a single node.
    Memory,
    /// Redis pub/sub.
    #[default]
    Redis,
}

/// Backbone settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackboneSettings {
    /// Backbone implementation.
    pub kind: BackboneKind,
    /// Connection URL (redis only).
    pub url: String,
}

impl Default for BackboneSettings {
    fn default() -> Self {
        Self {
            kind: BackboneKind::Redis,
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// Heartbeat and write-timeout settings, in milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LivenessSettings {
    /// Interval between liveness probes.
    pub ping_interval_ms: u64,
    /// Close a connection after this long without a pong.
    pub pong_timeout_ms: u64,
    /// Bound on every individual write, probe and close.
    pub write_timeout_ms: u64,
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self {
            ping_interval_ms: 20_000,
            pong_timeout_ms: 60_000,
            write_timeout_ms: 10_000,
        }
    }
}

/// Shutdown settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShutdownSettings {
    /// Deadline for the whole drain sequence.
    pub deadline_ms: u64,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self { deadline_ms: 30_000 }
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level (`trace`..`error`). `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Per-module level overrides, e.g. `("roomcast_server", "debug")`.
    pub module_levels: Vec<(String, String)>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            module_levels: Vec::new(),
        }
    }
}
