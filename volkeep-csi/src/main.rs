//! volkeep-csi: CSI controller plugin.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use volkeep_csi::{Config, Driver, MemoryBackend};

#[derive(Parser, Debug)]
#[command(name = "volkeep-csi")]
#[command(about = "CSI controller plugin for volkeep")]
struct Args {
    /// CSI endpoint (unix:// or tcp://). Overrides the config file.
    #[arg(long)]
    endpoint: Option<String>,

    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Plugin name reported by GetPluginInfo. Overrides the config file.
    #[arg(long)]
    name: Option<String>,

    /// Give up waiting for a busy volume after this many milliseconds.
    #[arg(long)]
    lock_wait_timeout_ms: Option<u64>,

    /// Verbosity level (0-4).
    #[arg(short, default_value = "0")]
    v: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Only volkeep crates get detailed logging; h2, tonic and hyper stay at warn.
    let filter = match args.v {
        0 => "warn".to_string(),
        1 => "volkeep_csi=info,volkeep_dial=info,warn".to_string(),
        2 => "volkeep_csi=debug,volkeep_dial=debug,warn".to_string(),
        3 => "volkeep_csi=trace,volkeep_dial=trace,warn".to_string(),
        _ => "volkeep_csi=trace,volkeep_dial=trace,info".to_string(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }
    if let Some(name) = args.name {
        config.name = name;
    }
    if let Some(ms) = args.lock_wait_timeout_ms {
        config.controller.lock_wait_timeout_ms = Some(ms);
    }

    info!(
        name = %config.name,
        version = %config.version,
        endpoint = %config.endpoint,
        "starting volkeep CSI controller"
    );

    let backend = Arc::new(MemoryBackend::new(config.backend.clone()));
    let driver = Driver::new(config, backend).context("invalid configuration")?;
    driver.run_until(shutdown_signal()).await?;

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
