//! hooktrace-server - live trace collector for AI coding agents
//!
//! Receives hook events over HTTP, correlates them into runs, agents and
//! spans, persists per-run trace logs, and streams deltas to WebSocket
//! observers.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use hooktrace_core::Config;
use hooktrace_server::TraceServer;

#[derive(Parser, Debug)]
#[command(name = "hooktrace-server")]
#[command(about = "Live trace collector for AI coding agents")]
#[command(version)]
struct Args {
    /// Bind address (overrides config)
    #[arg(long)]
    bind: Option<String>,

    /// Listen port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Trace log directory (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Path to a config file (default: ~/.config/hooktrace/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();
    let mut config = match &args.config {
        Some(path) => Config::load_from(path).context("failed to load configuration")?,
        None => Config::load().context("failed to load configuration")?,
    };

    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.storage.data_dir = Some(data_dir);
    }

    // Foreground server: log to stdout as well as the state-dir file
    config.logging.stdout = true;
    let _log_guard = hooktrace_core::logging::init(&config.logging)
        .context("failed to initialize logging")?;

    tracing::info!("Starting hooktrace-server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        data_dir = %config.storage.resolve_data_dir().display(),
        "Trace logs"
    );

    let server = TraceServer::new(config).context("failed to build server")?;
    server.run().await
}
