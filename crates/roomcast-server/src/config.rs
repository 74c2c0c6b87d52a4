//! Runtime configuration for a relay node.

use std::time::Duration;

use roomcast_settings::RoomcastSettings;

/// Runtime view of [`RoomcastSettings`] with durations resolved.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` for auto-assign).
    pub port: u16,
    /// Path of the WebSocket upgrade endpoint.
    pub ws_path: String,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Interval between liveness probes.
    pub ping_interval: Duration,
    /// Close a connection after this long without a pong.
    pub pong_timeout: Duration,
    /// Bound on each individual write, probe and close.
    pub write_timeout: Duration,
    /// Deadline for the shutdown sequence.
    pub shutdown_deadline: Duration,
}

impl ServerConfig {
    /// Resolve from loaded settings.
    pub fn from_settings(settings: &RoomcastSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            ws_path: settings.server.ws_path.clone(),
            max_message_size: settings.server.max_message_size,
            ping_interval: Duration::from_millis(settings.liveness.ping_interval_ms),
            pong_timeout: Duration::from_millis(settings.liveness.pong_timeout_ms),
            write_timeout: Duration::from_millis(settings.liveness.write_timeout_ms),
            shutdown_deadline: Duration::from_millis(settings.shutdown.deadline_ms),
        }
    }

    /// `host:port` bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Loopback on an auto-assigned port; everything else from settings defaults.
impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            ..Self::from_settings(&RoomcastSettings::default())
        }
    }
}
