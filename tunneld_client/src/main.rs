use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use shared_utils::config::{Config, ConfigError};
use shared_utils::logging::{init_logging, LogOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use tunneld_client::{ClientCommandService, InMemoryTunnelRepository, StatusStream, TunnelRepository};
use tunneld_ipc::messages::RestoreSettingsRequest;
use tunneld_ipc::{
    BackendStatus, DaemonApi, DaemonClient, FileSecretStore, KillSwitchSettings, Mode, TunnelId,
};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LogLevelArg {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevelArg> for tracing::Level {
    fn from(level: LogLevelArg) -> Self {
        match level {
            LogLevelArg::Trace => tracing::Level::TRACE,
            LogLevelArg::Debug => tracing::Level::DEBUG,
            LogLevelArg::Info => tracing::Level::INFO,
            LogLevelArg::Warn => tracing::Level::WARN,
            LogLevelArg::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, after_help = "Examples:\n  tunnelctl status --output json\n  tunnelctl start 1\n  tunnelctl kill-switch on --bypass-lan")]
struct Args {
    /// Log level
    #[arg(short, long, value_enum, default_value = "warn", env = "TUNNELCTL_LOG_LEVEL")]
    log_level: LogLevelArg,

    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Daemon socket (overrides the configuration)
    #[arg(short, long)]
    socket_path: Option<PathBuf>,

    /// Output format for command results (table|json)
    #[arg(long, value_enum, default_value = "table")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the daemon is reachable
    Ping,
    /// Show the backend status
    Status,
    /// Follow backend status changes until interrupted
    Watch,
    /// List configured tunnels
    List,
    /// Start a configured tunnel, stopping any other active one
    Start { id: TunnelId },
    /// Stop a tunnel
    Stop { id: TunnelId },
    /// Switch the engine mode (userspace|proxy)
    Mode { mode: Mode },
    /// Turn the kill switch on or off
    KillSwitch {
        #[arg(value_enum)]
        state: Toggle,
        /// Let LAN traffic bypass the kill switch
        #[arg(long)]
        bypass_lan: bool,
    },
    /// Show or change boot restoration settings
    Settings {
        #[arg(long)]
        restore_kill_switch: Option<bool>,
        #[arg(long)]
        restore_tunnel: Option<bool>,
    },
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(Config::default_path);
    match Config::load(&path) {
        Ok(config) => Ok(config),
        Err(ConfigError::FileNotFound(_)) => {
            let mut config = Config::default();
            config.apply_overrides(|key| std::env::var(key).ok());
            Ok(config)
        }
        Err(e) => Err(e).with_context(|| format!("failed to load {}", path.display())),
    }
}

fn print<T: Serialize + std::fmt::Debug>(output: OutputFormat, value: &T) -> Result<()> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Table => println!("{value:#?}"),
    }
    Ok(())
}

fn print_status(output: OutputFormat, status: &BackendStatus) -> Result<()> {
    if let OutputFormat::Json = output {
        return print(output, status);
    }
    println!("mode:        {}", status.mode);
    println!(
        "kill switch: {}",
        if status.kill_switch_enabled { "on" } else { "off" }
    );
    if status.active_tunnels.is_empty() {
        println!("tunnels:     none");
    }
    for (id, active) in &status.active_tunnels {
        println!("tunnel {id:>4}: {:<20} {:?}", active.tunnel.name, active.state);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = init_logging(LogOptions {
        level: args.log_level.into(),
        ..Default::default()
    });

    let config = load_config(args.config.as_deref())?;
    let socket_path = args
        .socket_path
        .unwrap_or_else(|| config.client.socket_path.clone());

    let secrets = match &config.client.secret_path {
        Some(path) => FileSecretStore::new(path),
        None => FileSecretStore::for_current_user().context("failed to locate IPC secret")?,
    };
    debug!(secret = %secrets.local_path().display(), socket = %socket_path.display(), "Connecting");
    let client = Arc::new(DaemonClient::for_current_user(&socket_path, &secrets)?);

    let repository = Arc::new(InMemoryTunnelRepository::from_entries(
        &config.client.tunnels,
    ));
    let service = ClientCommandService::new(client.clone(), repository.clone());

    match args.command {
        Command::Ping => {
            let health = client.daemon_status().await?;
            print(args.output, &health)?;
        }
        Command::Status => {
            let status = client.backend_status().await?;
            print_status(args.output, &status)?;
        }
        Command::Watch => {
            let stream = StatusStream::spawn(client.clone(), config.client.reconnect_interval());
            let mut updates = stream.subscribe();
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let latest = updates.borrow_and_update().clone();
                        if let Some(status) = latest {
                            print_status(args.output, &status)?;
                        }
                    }
                }
            }
        }
        Command::List => {
            for stored in repository.list().await {
                println!(
                    "{:>4}  {:<20} {}",
                    stored.tunnel.id,
                    stored.tunnel.name,
                    if stored.active { "active" } else { "" }
                );
            }
        }
        Command::Start { id } => {
            service.reconcile().await?;
            service.start_tunnel(id).await?;
            println!("tunnel {id} started");
        }
        Command::Stop { id } => {
            service.stop_tunnel(id).await?;
            println!("tunnel {id} stopped");
        }
        Command::Mode { mode } => {
            service.set_mode(mode).await?;
            println!("mode set to {mode}");
        }
        Command::KillSwitch { state, bypass_lan } => {
            let settings = KillSwitchSettings {
                enabled: matches!(state, Toggle::On),
                bypass_lan,
            };
            service.set_kill_switch(settings).await?;
            println!(
                "kill switch {}",
                if settings.enabled { "enabled" } else { "disabled" }
            );
        }
        Command::Settings {
            restore_kill_switch,
            restore_tunnel,
        } => {
            let settings = if restore_kill_switch.is_none() && restore_tunnel.is_none() {
                client.settings().await?
            } else {
                client
                    .update_settings(RestoreSettingsRequest {
                        restore_kill_switch_on_boot: restore_kill_switch,
                        restore_tunnel_on_boot: restore_tunnel,
                    })
                    .await?
            };
            print(args.output, &settings)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_kill_switch_args() {
        let args = Args::try_parse_from([
            "tunnelctl",
            "--log-level",
            "debug",
            "kill-switch",
            "on",
            "--bypass-lan",
        ])
        .unwrap();
        assert!(matches!(args.log_level, LogLevelArg::Debug));
        assert!(matches!(
            args.command,
            Command::KillSwitch {
                state: Toggle::On,
                bypass_lan: true
            }
        ));
    }
}
