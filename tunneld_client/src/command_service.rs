//! Client command service
//!
//! Turns user actions into signed daemon calls while keeping the local
//! tunnel store consistent with what the daemon accepted. Start and stop
//! sequences run one at a time, and at most one tunnel is marked active.

use crate::repository::TunnelRepository;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use tunneld_ipc::{BackendStatus, DaemonApi, DaemonError, KillSwitchSettings, Mode, TunnelId};

/// Result type for client commands
pub type CommandResult<T> = Result<T, CommandError>;

/// Error type for client commands
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The tunnel is not in the local store
    #[error("tunnel {0} not found")]
    TunnelNotFound(TunnelId),

    /// The daemon could not be reached or refused the command
    #[error(transparent)]
    Daemon(#[from] DaemonError),
}

/// Client-side façade over the daemon API
pub struct ClientCommandService {
    api: Arc<dyn DaemonApi>,
    repository: Arc<dyn TunnelRepository>,
    serial: Mutex<()>,
}

impl ClientCommandService {
    pub fn new(api: Arc<dyn DaemonApi>, repository: Arc<dyn TunnelRepository>) -> Self {
        Self {
            api,
            repository,
            serial: Mutex::new(()),
        }
    }

    /// Start tunnel `id`, stopping any other locally active tunnel first.
    ///
    /// If the daemon does not accept the start, the tunnel is marked
    /// inactive again before the error is returned.
    pub async fn start_tunnel(&self, id: TunnelId) -> CommandResult<()> {
        let _serial = self.serial.lock().await;

        let stored = self
            .repository
            .get(id)
            .await
            .ok_or(CommandError::TunnelNotFound(id))?;

        for other in self.repository.list().await {
            if !other.active || other.tunnel.id == id {
                continue;
            }
            match self.api.stop_tunnel(other.tunnel.id).await {
                Ok(()) => debug!(tunnel_id = other.tunnel.id, "Stopped previous tunnel"),
                Err(e) if e.is_conflict() => {}
                Err(e) => warn!(
                    tunnel_id = other.tunnel.id,
                    "Failed to stop previous tunnel, continuing anyway: {e}"
                ),
            }
            self.repository.set_active(other.tunnel.id, false).await;
        }

        self.repository.set_active(id, true).await;
        match self
            .api
            .start_tunnel(&stored.tunnel, &stored.quick_config)
            .await
        {
            Ok(()) => {
                info!(tunnel_id = id, "Tunnel started");
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                debug!(tunnel_id = id, "Tunnel was already active on the daemon");
                Ok(())
            }
            Err(e) => {
                self.repository.set_active(id, false).await;
                error!(tunnel_id = id, "Failed to start tunnel: {e}");
                Err(e.into())
            }
        }
    }

    /// Stop tunnel `id`. The local flag is cleared before the daemon is
    /// contacted and stays cleared even if the call fails.
    pub async fn stop_tunnel(&self, id: TunnelId) -> CommandResult<()> {
        let _serial = self.serial.lock().await;

        if self.repository.get(id).await.is_none() {
            return Err(CommandError::TunnelNotFound(id));
        }
        self.repository.set_active(id, false).await;

        match self.api.stop_tunnel(id).await {
            Ok(()) => {
                info!(tunnel_id = id, "Tunnel stopped");
                Ok(())
            }
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => {
                error!(tunnel_id = id, "Failed to stop tunnel: {e}");
                Err(e.into())
            }
        }
    }

    /// Apply kill switch `settings`, restoring the previous local value if
    /// the daemon fails to apply them.
    pub async fn set_kill_switch(&self, settings: KillSwitchSettings) -> CommandResult<()> {
        let _serial = self.serial.lock().await;

        let previous = self.repository.kill_switch().await;
        self.repository.set_kill_switch(settings).await;

        match self.api.set_kill_switch(settings).await {
            Ok(()) => Ok(()),
            // The daemon answers 400 when it is already in the requested state
            Err(DaemonError::BadRequest(reason)) => {
                debug!("Kill switch unchanged on the daemon: {reason}");
                Ok(())
            }
            Err(e) => {
                self.repository.set_kill_switch(previous).await;
                error!("Failed to set kill switch: {e}");
                Err(e.into())
            }
        }
    }

    pub async fn set_mode(&self, mode: Mode) -> CommandResult<()> {
        self.api.set_mode(mode).await?;
        Ok(())
    }

    /// Align local activity flags with the daemon's view
    pub async fn reconcile(&self) -> CommandResult<BackendStatus> {
        let _serial = self.serial.lock().await;

        let status = self.api.backend_status().await?;
        for stored in self.repository.list().await {
            let active = status.is_active(stored.tunnel.id);
            if active != stored.active {
                self.repository.set_active(stored.tunnel.id, active).await;
            }
        }
        self.repository
            .set_kill_switch(KillSwitchSettings {
                enabled: status.kill_switch_enabled,
                ..self.repository.kill_switch().await
            })
            .await;
        Ok(status)
    }
}
