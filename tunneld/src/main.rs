//! tunneld
//!
//! Privileged daemon that owns tunnel lifecycle state and serves the signed
//! local API on a Unix Domain Socket.

use anyhow::Context;
use clap::Parser;
use shared_utils::config::{Config, ConfigError};
use shared_utils::logging::{init_logging, parse_level, LogOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tunneld::{
    DaemonServer, DaemonSettingsCache, DryRunEngine, LoggingListener, TunnelBackend, TunnelEngine,
};
use tunneld_ipc::{FileSecretStore, SecretStore};

/// Command-line arguments for the daemon
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to the configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Path to the Unix Domain Socket to serve on
    #[clap(short, long)]
    socket_path: Option<PathBuf>,

    /// Directory holding durable daemon settings
    #[clap(long)]
    settings_dir: Option<PathBuf>,

    /// Log level
    #[clap(short, long)]
    log_level: Option<String>,

    /// Also write daily-rolling log files into this directory
    #[clap(long)]
    log_dir: Option<PathBuf>,

    /// Emit logs as JSON
    #[clap(long)]
    json_logs: bool,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(Config::default_path);
    match Config::load(&path) {
        Ok(config) => Ok(config),
        Err(ConfigError::FileNotFound(_)) => {
            let mut config = Config::default();
            config.apply_overrides(|key| std::env::var(key).ok());
            config.validate()?;
            Ok(config)
        }
        Err(e) => Err(e).with_context(|| format!("failed to load {}", path.display())),
    }
}

async fn wait_for_termination() {
    let signals = signal(SignalKind::terminate())
        .and_then(|term| signal(SignalKind::interrupt()).map(|int| (term, int)));
    match signals {
        Ok((mut term, mut int)) => {
            tokio::select! {
                _ = term.recv() => info!("Received SIGTERM"),
                _ = int.recv() => info!("Received SIGINT"),
            }
        }
        Err(e) => {
            error!("Failed to install signal handlers: {e}");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to wait for Ctrl-C: {e}");
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(path) = args.socket_path {
        config.daemon.socket_path = path;
    }
    if let Some(dir) = args.settings_dir {
        config.daemon.settings_dir = dir;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    let _guard = init_logging(LogOptions {
        level: parse_level(&config.log_level),
        file_dir: args.log_dir,
        json: args.json_logs,
        ..Default::default()
    });

    info!("tunneld {} starting up", env!("CARGO_PKG_VERSION"));
    if !nix::unistd::geteuid().is_root() {
        warn!("Not running as root; engine and socket operations may fail");
    }

    // Composition root
    let engine: Arc<dyn TunnelEngine> = Arc::new(DryRunEngine::new().reporting_healthy());
    warn!("No native tunnel engine linked, using the dry-run engine");

    let backend = Arc::new(TunnelBackend::new(engine));
    let settings = Arc::new(DaemonSettingsCache::new(&config.daemon.settings_dir));
    let secrets: Arc<dyn SecretStore> = Arc::new(FileSecretStore::new(
        config.daemon.settings_dir.join("daemon.key"),
    ));
    let server = Arc::new(DaemonServer::new(
        &config.daemon,
        backend,
        settings,
        secrets,
        Arc::new(LoggingListener),
    ));

    server
        .start()
        .await
        .context("failed to start daemon server")?;

    let signal_task = tokio::spawn({
        let server = server.clone();
        async move {
            wait_for_termination().await;
            server.stop().await;
        }
    });

    server.wait().await;
    signal_task.abort();
    info!("tunneld exited cleanly");
    Ok(())
}
