//! # roomcast
//!
//! Relay node binary: loads settings, initialises logging and metrics,
//! connects the backbone, serves WebSocket clients and shuts down gracefully
//! on Ctrl-C or SIGTERM.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use roomcast_backbone::{Backbone, MemoryHub, RedisBackbone};
use roomcast_server::{PrefixTokenAuthenticator, RelayNode, ServerConfig};
use roomcast_settings::{BackboneKind, RoomcastSettings};

/// Multi-node WebSocket chat relay.
#[derive(Parser, Debug)]
#[command(name = "roomcast", version, about = "Multi-node WebSocket chat relay")]
struct Cli {
    /// Settings file (defaults to `~/.roomcast/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Redis URL of the shared backbone.
    #[arg(long, conflicts_with = "memory_backbone")]
    backbone_url: Option<String>,

    /// Use an in-process backbone (single node, no cross-node fan-out).
    #[arg(long)]
    memory_backbone: bool,

    /// Emit JSON logs.
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    /// Apply flags over loaded settings. Flags win over file and env.
    fn apply(&self, settings: &mut RoomcastSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(url) = &self.backbone_url {
            settings.backbone.kind = BackboneKind::Redis;
            settings.backbone.url.clone_from(url);
        }
        if self.memory_backbone {
            settings.backbone.kind = BackboneKind::Memory;
        }
        if self.log_json {
            settings.logging.json = true;
        }
    }
}

fn load(cli: &Cli) -> Result<RoomcastSettings> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(roomcast_settings::settings_path);
    let mut settings = roomcast_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);
    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

async fn connect_backbone(settings: &RoomcastSettings) -> Result<Arc<dyn Backbone>> {
    match settings.backbone.kind {
        BackboneKind::Memory => {
            tracing::warn!("using in-process backbone; messages stay on this node");
            Ok(Arc::new(MemoryHub::new().backbone()))
        }
        BackboneKind::Redis => {
            let backbone = RedisBackbone::connect(&settings.backbone.url)
                .await
                .with_context(|| format!("Failed to connect backbone at {}", settings.backbone.url))?;
            Ok(Arc::new(backbone))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                let _ = sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;

    roomcast_logging::init_logging(&settings.logging).context("Failed to initialise logging")?;

    let metrics = match roomcast_server::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "metrics recorder not installed, /metrics disabled");
            None
        }
    };

    let backbone = connect_backbone(&settings).await?;
    let config = ServerConfig::from_settings(&settings);
    let deadline = config.shutdown_deadline;
    let node = RelayNode::launch(config, backbone);

    let server = roomcast_server::start(
        Arc::clone(&node),
        Arc::new(PrefixTokenAuthenticator::default()),
        metrics,
    )
    .await
    .context("Failed to start server")?;

    tracing::info!(
        node_id = %node.node_id(),
        addr = %server.addr(),
        backbone = ?settings.backbone.kind,
        "roomcast node ready"
    );

    shutdown_signal().await;
    tracing::info!("shutdown signal received");

    match server.shutdown(deadline).await {
        Ok(()) => tracing::info!("shutdown complete"),
        Err(e) => tracing::warn!(error = %e, "shutdown finished with errors"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_leave_settings_untouched() {
        let cli = Cli::parse_from(["roomcast"]);
        let mut settings = RoomcastSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.backbone.kind, BackboneKind::Redis);
        assert!(!settings.logging.json);
    }

    #[test]
    fn cli_overrides_host_and_port() {
        let cli = Cli::parse_from(["roomcast", "--host", "127.0.0.1", "--port", "9000"]);
        let mut settings = RoomcastSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 9000);
    }

    #[test]
    fn cli_memory_backbone() {
        let cli = Cli::parse_from(["roomcast", "--memory-backbone", "--log-json"]);
        let mut settings = RoomcastSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.backbone.kind, BackboneKind::Memory);
        assert!(settings.logging.json);
    }

    #[test]
    fn cli_backbone_url_selects_redis() {
        let cli = Cli::parse_from(["roomcast", "--backbone-url", "redis://cache:6380"]);
        let mut settings = RoomcastSettings::default();
        settings.backbone.kind = BackboneKind::Memory;
        cli.apply(&mut settings);
        assert_eq!(settings.backbone.kind, BackboneKind::Redis);
        assert_eq!(settings.backbone.url, "redis://cache:6380");
    }

    #[test]
    fn backbone_flags_conflict() {
        let result = Cli::try_parse_from([
            "roomcast",
            "--memory-backbone",
            "--backbone-url",
            "redis://x",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn load_reads_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server":{"port":7001},"backbone":{"kind":"memory"}}"#).unwrap();

        let cli = Cli::parse_from(["roomcast", "--config", path.to_str().unwrap(), "--port", "7002"]);
        let settings = load(&cli).unwrap();
        assert_eq!(settings.server.port, 7002);
        assert_eq!(settings.backbone.kind, BackboneKind::Memory);
    }

    #[test]
    fn load_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        let cli = Cli::parse_from(["roomcast", "--config", path.to_str().unwrap()]);
        assert!(load(&cli).is_err());
    }

    #[tokio::test]
    async fn memory_backbone_connects() {
        let mut settings = RoomcastSettings::default();
        settings.backbone.kind = BackboneKind::Memory;
        let backbone = connect_backbone(&settings).await.unwrap();
        assert!(!backbone.is_closed());
    }
}
