//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RoomcastSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `ROOMCAST_*` environment overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::{BackboneKind, RoomcastSettings};

/// Resolve the default settings file (`~/.roomcast/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".roomcast").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<RoomcastSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<RoomcastSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<RoomcastSettings> {
    let malformed = |source| SettingsError::Malformed {
        path: path.to_path_buf(),
        source,
    };
    let defaults = serde_json::to_value(RoomcastSettings::default()).map_err(malformed)?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(malformed)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    serde_json::from_value(merged).map_err(malformed)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `ROOMCAST_*` environment variable overrides.
pub fn apply_env_overrides(settings: &mut RoomcastSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable source.
///
/// Invalid values are ignored with a warning and the file/default value
/// stays in place.
pub fn apply_overrides_from<F>(settings: &mut RoomcastSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let vars = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = vars.string("ROOMCAST_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = vars.u16("ROOMCAST_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = vars.string("ROOMCAST_WS_PATH") {
        settings.server.ws_path = v;
    }
    if let Some(v) = vars.usize("ROOMCAST_MAX_MESSAGE_SIZE", 1024, 64 * 1024 * 1024) {
        settings.server.max_message_size = v;
    }

    // ── Backbone ────────────────────────────────────────────────────
    if let Some(v) = vars.string("ROOMCAST_BACKBONE") {
        match parse_backbone_kind(&v) {
            Some(kind) => settings.backbone.kind = kind,
            None => tracing::warn!(key = "ROOMCAST_BACKBONE", value = %v, "unknown backbone, ignoring"),
        }
    }
    if let Some(v) = vars.string("ROOMCAST_BACKBONE_URL") {
        settings.backbone.url = v;
    }

    // ── Liveness ────────────────────────────────────────────────────
    if let Some(v) = vars.u64("ROOMCAST_PING_INTERVAL_MS", 100, 3_600_000) {
        settings.liveness.ping_interval_ms = v;
    }
    if let Some(v) = vars.u64("ROOMCAST_PONG_TIMEOUT_MS", 100, 3_600_000) {
        settings.liveness.pong_timeout_ms = v;
    }
    if let Some(v) = vars.u64("ROOMCAST_WRITE_TIMEOUT_MS", 10, 600_000) {
        settings.liveness.write_timeout_ms = v;
    }

    // ── Shutdown / logging ──────────────────────────────────────────
    if let Some(v) = vars.u64("ROOMCAST_SHUTDOWN_DEADLINE_MS", 0, 3_600_000) {
        settings.shutdown.deadline_ms = v;
    }
    if let Some(v) = vars.string("ROOMCAST_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = vars.bool("ROOMCAST_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a backbone kind (`memory` or `redis`, case-insensitive).
pub fn parse_backbone_kind(val: &str) -> Option<BackboneKind> {
    match val.to_lowercase().as_str() {
        "memory" => Some(BackboneKind::Memory),
        "redis" => Some(BackboneKind::Redis),
        _ => None,
    }
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Variable readers (thin wrappers) ────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = (self.lookup)(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = (self.lookup)(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}
