//! # switchboard
//!
//! Server binary: loads settings, installs logging and metrics, and serves a
//! small chat application on the WebSocket endpoint.

#![deny(unsafe_code)]

mod app;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use switchboard_server::SwitchboardServer;
use switchboard_settings::SwitchboardSettings;

/// How long shutdown waits for sessions to close.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// switchboard WebSocket server.
#[derive(Parser, Debug)]
#[command(name = "switchboard", about = "switchboard WebSocket server")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// WebSocket endpoint path (overrides settings).
    #[arg(long)]
    endpoint: Option<String>,

    /// Heartbeat interval and read deadline in seconds, 0 to disable.
    #[arg(long)]
    keepalive_secs: Option<u64>,

    /// Settings file (default `~/.switchboard/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log level (overrides settings; `RUST_LOG` wins over both).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(self, settings: &mut SwitchboardSettings) {
        if let Some(host) = self.host {
            settings.server.host = host;
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(endpoint) = self.endpoint {
            settings.server.endpoint = endpoint;
        }
        if let Some(secs) = self.keepalive_secs {
            settings.server.keepalive_secs = secs;
        }
        if let Some(level) = self.log_level {
            settings.logging.level = level;
        }
    }
}

fn load_settings(cli: &Cli) -> Result<SwitchboardSettings> {
    let settings = match &cli.settings {
        Some(path) => switchboard_settings::load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => switchboard_settings::load_settings().context("Failed to load settings")?,
    };
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = load_settings(&cli)?;
    cli.apply(&mut settings);
    settings.validate().context("Invalid settings")?;

    if settings.logging.json {
        switchboard_core::logging::init_json_subscriber(&settings.logging.level);
    } else {
        switchboard_core::logging::init_subscriber(&settings.logging.level);
    }

    let metrics_handle = switchboard_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;
    let server = SwitchboardServer::new(settings.server, app::ChatHooks).with_metrics(metrics_handle);

    let (addr, handle) = server.listen().await.context("Failed to bind listener")?;
    tracing::info!(
        "switchboard listening on ws://{addr}{}",
        server.settings().endpoint
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server
        .shutdown()
        .graceful_shutdown(vec![handle], Some(SHUTDOWN_TIMEOUT))
        .await;
    tracing::info!("Shutdown complete");
    Ok(())
}
