//! Tunnel backend
//!
//! [`TunnelBackend`] owns every piece of tunnel lifecycle state in the
//! daemon: the active-tunnel map, the operating mode, and the kill switch.
//! All mutations are serialized through one lock and each one publishes a
//! fresh [`BackendStatus`] snapshot on a watch channel. Engine calls are made
//! outside the lock so different tunnels can start and stop concurrently.

pub mod dry_run;
pub mod engine;

pub use dry_run::DryRunEngine;
pub use engine::{state_from_code, EngineHandle, TunnelEngine};

use futures::stream::{BoxStream, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tunneld_ipc::{
    ActiveTunnel, BackendStatus, KillSwitchSettings, Mode, Tunnel, TunnelId, TunnelState,
};

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Error type for backend operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The engine refused to bring the tunnel up
    #[error("engine failed to start tunnel {tunnel} (code {code})")]
    StartFailed { tunnel: String, code: EngineHandle },

    /// The tunnel was stopped, or the mode changed, while it was starting
    #[error("tunnel {0} was torn down before it finished starting")]
    StartAborted(TunnelId),

    /// The engine reported an error while applying the kill switch
    #[error("engine failed to set kill switch (code {0})")]
    KillSwitchSetFailed(i32),
}

/// Outcome of a state-changing call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The backend changed state
    Applied,
    /// The backend was already in the requested state; nothing was done
    Unchanged,
}

/// Observer notified of every state a tunnel passes through
pub trait TunnelStateListener: Send + Sync {
    fn update_state(&self, tunnel: &Tunnel, state: TunnelState);
}

/// Listener that only logs transitions
pub struct LoggingListener;

impl TunnelStateListener for LoggingListener {
    fn update_state(&self, tunnel: &Tunnel, state: TunnelState) {
        info!(tunnel_id = tunnel.id, name = %tunnel.name, ?state, "Tunnel state changed");
    }
}

struct TunnelEntry {
    tunnel: Tunnel,
    state: TunnelState,
    /// Distinguishes this start attempt from later ones for the same id
    generation: u64,
    handle: Option<EngineHandle>,
    task: Option<JoinHandle<()>>,
    listener: Arc<dyn TunnelStateListener>,
}

impl TunnelEntry {
    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct BackendState {
    mode: Mode,
    kill_switch: KillSwitchSettings,
    tunnels: HashMap<TunnelId, TunnelEntry>,
    next_generation: u64,
}

struct Shared {
    state: Mutex<BackendState>,
    status_tx: watch::Sender<BackendStatus>,
}

impl Shared {
    /// Publish the snapshot of `state`. Callers hold the state lock.
    fn publish(&self, state: &BackendState) {
        let active_tunnels: BTreeMap<TunnelId, ActiveTunnel> = state
            .tunnels
            .iter()
            .map(|(id, entry)| {
                (
                    *id,
                    ActiveTunnel {
                        tunnel: entry.tunnel.clone(),
                        state: entry.state,
                    },
                )
            })
            .collect();

        self.status_tx.send_replace(BackendStatus {
            kill_switch_enabled: state.kill_switch.enabled,
            mode: state.mode,
            active_tunnels,
        });
    }
}

/// Stateful orchestrator around a [`TunnelEngine`]
pub struct TunnelBackend {
    engine: Arc<dyn TunnelEngine>,
    shared: Arc<Shared>,
    kill_switch_lock: Mutex<()>,
}

impl TunnelBackend {
    pub fn new(engine: Arc<dyn TunnelEngine>) -> Self {
        Self::with_mode(engine, Mode::default())
    }

    pub fn with_mode(engine: Arc<dyn TunnelEngine>, mode: Mode) -> Self {
        let (status_tx, _) = watch::channel(BackendStatus {
            mode,
            ..Default::default()
        });
        Self {
            engine,
            shared: Arc::new(Shared {
                state: Mutex::new(BackendState {
                    mode,
                    kill_switch: KillSwitchSettings::default(),
                    tunnels: HashMap::new(),
                    next_generation: 0,
                }),
                status_tx,
            }),
            kill_switch_lock: Mutex::new(()),
        }
    }

    /// Latest published snapshot
    pub fn status(&self) -> BackendStatus {
        self.shared.status_tx.borrow().clone()
    }

    /// Receiver that observes every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<BackendStatus> {
        self.shared.status_tx.subscribe()
    }

    pub async fn mode(&self) -> Mode {
        self.shared.state.lock().await.mode
    }

    /// Kill switch settings last confirmed by the engine
    pub async fn kill_switch(&self) -> KillSwitchSettings {
        self.shared.state.lock().await.kill_switch
    }

    /// Bring `tunnel` up under the current mode.
    ///
    /// Returns [`Transition::Unchanged`] without touching the engine if the
    /// tunnel is already tracked.
    pub async fn start(
        &self,
        tunnel: Tunnel,
        quick_config: &str,
        listener: Arc<dyn TunnelStateListener>,
    ) -> BackendResult<Transition> {
        let (mode, generation) = {
            let mut state = self.shared.state.lock().await;
            if state.tunnels.contains_key(&tunnel.id) {
                debug!(tunnel_id = tunnel.id, "Tunnel already active, ignoring start");
                return Ok(Transition::Unchanged);
            }
            state.next_generation += 1;
            let generation = state.next_generation;
            state.tunnels.insert(
                tunnel.id,
                TunnelEntry {
                    tunnel: tunnel.clone(),
                    state: TunnelState::Starting,
                    generation,
                    handle: None,
                    task: None,
                    listener: listener.clone(),
                },
            );
            self.shared.publish(&state);
            (state.mode, generation)
        };
        listener.update_state(&tunnel, TunnelState::Starting);

        info!(tunnel_id = tunnel.id, name = %tunnel.name, %mode, "Starting tunnel");
        let handle = self.engine.turn_on(mode, &tunnel.name, quick_config).await;

        if handle < 0 {
            {
                let mut state = self.shared.state.lock().await;
                if Self::is_current(&state, tunnel.id, generation) {
                    state.tunnels.remove(&tunnel.id);
                    self.shared.publish(&state);
                }
            }
            listener.update_state(&tunnel, TunnelState::Down);
            error!(tunnel_id = tunnel.id, code = handle, "Engine failed to start tunnel");
            return Err(BackendError::StartFailed {
                tunnel: tunnel.name,
                code: handle,
            });
        }

        let updates = self.engine.status_updates(mode, handle).await;

        let attached = {
            let mut state = self.shared.state.lock().await;
            match state
                .tunnels
                .get_mut(&tunnel.id)
                .filter(|entry| entry.generation == generation)
            {
                Some(entry) => {
                    entry.handle = Some(handle);
                    entry.task = Some(tokio::spawn(follow_status(
                        self.shared.clone(),
                        tunnel.id,
                        generation,
                        updates,
                    )));
                    true
                }
                None => false,
            }
        };

        if attached {
            debug!(tunnel_id = tunnel.id, handle, "Tunnel handle attached");
            Ok(Transition::Applied)
        } else {
            warn!(
                tunnel_id = tunnel.id,
                handle, "Tunnel was torn down while starting, releasing handle"
            );
            self.engine.turn_off(mode, handle).await;
            Err(BackendError::StartAborted(tunnel.id))
        }
    }

    /// Take tunnel `id` down. [`Transition::Unchanged`] if it is not active.
    pub async fn stop(&self, id: TunnelId) -> Transition {
        let (mut entry, mode) = {
            let mut state = self.shared.state.lock().await;
            let Some(mut entry) = state.tunnels.remove(&id) else {
                debug!(tunnel_id = id, "Tunnel not active, ignoring stop");
                return Transition::Unchanged;
            };
            entry.cancel();
            self.shared.publish(&state);
            (entry, state.mode)
        };

        info!(tunnel_id = id, "Stopping tunnel");
        if let Some(handle) = entry.handle.take() {
            self.engine.turn_off(mode, handle).await;
        }
        entry.state = TunnelState::Down;
        entry.listener.update_state(&entry.tunnel, entry.state);
        Transition::Applied
    }

    /// Switch the engine mode, tearing down every tunnel first
    pub async fn set_mode(&self, mode: Mode) -> Transition {
        let (entries, previous) = {
            let mut state = self.shared.state.lock().await;
            if state.mode == mode {
                return Transition::Unchanged;
            }
            let entries = Self::drain(&mut state);
            self.shared.publish(&state);

            let previous = state.mode;
            state.mode = mode;
            self.shared.publish(&state);
            (entries, previous)
        };

        info!(from = %previous, to = %mode, torn_down = entries.len(), "Switched backend mode");
        self.teardown(previous, entries).await;
        Transition::Applied
    }

    /// Turn off every tunnel and clear all bookkeeping
    pub async fn shutdown(&self) {
        let (entries, mode) = {
            let mut state = self.shared.state.lock().await;
            let entries = Self::drain(&mut state);
            self.shared.publish(&state);
            (entries, state.mode)
        };

        if !entries.is_empty() {
            info!(count = entries.len(), "Shutting down all tunnels");
        }
        self.teardown(mode, entries).await;
    }

    /// Apply kill switch `settings`. The published flag follows the
    /// engine's answer rather than the request.
    pub async fn set_kill_switch(
        &self,
        settings: KillSwitchSettings,
    ) -> BackendResult<Transition> {
        let _serial = self.kill_switch_lock.lock().await;

        if self.shared.state.lock().await.kill_switch == settings {
            debug!(?settings, "Kill switch already in requested state");
            return Ok(Transition::Unchanged);
        }

        let result = self
            .engine
            .set_kill_switch(settings.enabled, settings.bypass_lan)
            .await;
        if result < 0 {
            error!(code = result, ?settings, "Engine failed to set kill switch");
            return Err(BackendError::KillSwitchSetFailed(result));
        }

        let mut state = self.shared.state.lock().await;
        state.kill_switch = KillSwitchSettings {
            enabled: result == 1,
            bypass_lan: settings.bypass_lan,
        };
        self.shared.publish(&state);
        info!(enabled = state.kill_switch.enabled, bypass_lan = settings.bypass_lan, "Kill switch updated");
        Ok(Transition::Applied)
    }

    fn is_current(state: &BackendState, id: TunnelId, generation: u64) -> bool {
        state
            .tunnels
            .get(&id)
            .is_some_and(|entry| entry.generation == generation)
    }

    fn drain(state: &mut BackendState) -> Vec<TunnelEntry> {
        state
            .tunnels
            .drain()
            .map(|(_, mut entry)| {
                entry.cancel();
                entry
            })
            .collect()
    }

    async fn teardown(&self, mode: Mode, entries: Vec<TunnelEntry>) {
        for entry in entries {
            if let Some(handle) = entry.handle {
                self.engine.turn_off(mode, handle).await;
            }
            entry.listener.update_state(&entry.tunnel, TunnelState::Down);
        }
    }
}

/// Apply engine status codes for one tunnel until the stream ends or the
/// tunnel is no longer the one this task was started for.
async fn follow_status(
    shared: Arc<Shared>,
    id: TunnelId,
    generation: u64,
    mut updates: BoxStream<'static, i32>,
) {
    while let Some(code) = updates.next().await {
        let next = state_from_code(code);
        let (tunnel, listener) = {
            let mut state = shared.state.lock().await;
            let Some(entry) = state
                .tunnels
                .get_mut(&id)
                .filter(|entry| entry.generation == generation)
            else {
                return;
            };
            entry.state = next;
            let observed = (entry.tunnel.clone(), entry.listener.clone());
            shared.publish(&state);
            observed
        };
        listener.update_state(&tunnel, next);
    }
    debug!(tunnel_id = id, "Engine status stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tunneld_ipc::TunnelHealth;

    #[derive(Default)]
    struct RecordingListener(StdMutex<Vec<TunnelState>>);

    impl RecordingListener {
        fn states(&self) -> Vec<TunnelState> {
            self.0.lock().unwrap().clone()
        }
    }

    impl TunnelStateListener for RecordingListener {
        fn update_state(&self, _tunnel: &Tunnel, state: TunnelState) {
            self.0.lock().unwrap().push(state);
        }
    }

    fn backend() -> (Arc<DryRunEngine>, TunnelBackend) {
        let engine = Arc::new(DryRunEngine::new());
        let backend = TunnelBackend::new(engine.clone());
        (engine, backend)
    }

    async fn wait_for_state(backend: &TunnelBackend, id: TunnelId, expected: TunnelState) {
        let mut rx = backend.subscribe();
        tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|status| status.state_of(id) == Some(expected)),
        )
        .await
        .expect("timed out waiting for tunnel state")
        .unwrap();
    }

    #[tokio::test]
    async fn test_start_then_healthy_then_stop() {
        let (engine, backend) = backend();
        let listener = Arc::new(RecordingListener::default());
        engine.script_handle(7);

        let result = backend
            .start(Tunnel::new(1, "home"), "[Interface]", listener.clone())
            .await;
        assert_eq!(result, Ok(Transition::Applied));
        assert_eq!(backend.status().state_of(1), Some(TunnelState::Starting));

        assert!(engine.emit_status(7, 0));
        wait_for_state(&backend, 1, TunnelState::Up(TunnelHealth::Healthy)).await;

        assert_eq!(backend.stop(1).await, Transition::Applied);
        assert!(backend.status().active_tunnels.is_empty());
        assert_eq!(engine.turned_off(), vec![(Mode::Userspace, 7)]);

        assert_eq!(
            listener.states(),
            vec![
                TunnelState::Starting,
                TunnelState::Up(TunnelHealth::Healthy),
                TunnelState::Down
            ]
        );
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (engine, backend) = backend();
        let listener = Arc::new(RecordingListener::default());

        let first = backend
            .start(Tunnel::new(1, "home"), "", listener.clone())
            .await;
        let after_first = backend.status();
        let second = backend
            .start(Tunnel::new(1, "home"), "", listener.clone())
            .await;

        assert_eq!(first, Ok(Transition::Applied));
        assert_eq!(second, Ok(Transition::Unchanged));
        assert_eq!(backend.status(), after_first);
        assert_eq!(engine.turned_on().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_start_removes_tunnel() {
        let (engine, backend) = backend();
        let listener = Arc::new(RecordingListener::default());
        engine.fail_next_start();

        let result = backend
            .start(Tunnel::new(3, "broken"), "", listener.clone())
            .await;

        assert!(matches!(result, Err(BackendError::StartFailed { code: -1, .. })));
        assert!(!backend.status().is_active(3));
        assert_eq!(
            listener.states(),
            vec![TunnelState::Starting, TunnelState::Down]
        );
        assert!(engine.turned_off().is_empty());
    }

    #[tokio::test]
    async fn test_stop_unknown_tunnel_is_unchanged() {
        let (engine, backend) = backend();
        assert_eq!(backend.stop(42).await, Transition::Unchanged);
        assert!(engine.turned_off().is_empty());
    }

    #[tokio::test]
    async fn test_unmapped_status_code_marks_down() {
        let (engine, backend) = backend();
        engine.script_handle(11);
        backend
            .start(Tunnel::new(5, "odd"), "", Arc::new(LoggingListener))
            .await
            .unwrap();

        engine.emit_status(11, 99);
        wait_for_state(&backend, 5, TunnelState::Down).await;
    }

    #[tokio::test]
    async fn test_mode_switch_tears_down_tunnels() {
        let (engine, backend) = backend();
        let listener: Arc<dyn TunnelStateListener> = Arc::new(LoggingListener);
        engine.script_handle(1);
        engine.script_handle(2);
        backend
            .start(Tunnel::new(1, "home"), "", listener.clone())
            .await
            .unwrap();
        backend
            .start(Tunnel::new(2, "work"), "", listener.clone())
            .await
            .unwrap();

        let mut rx = backend.subscribe();
        assert_eq!(backend.set_mode(Mode::Proxy).await, Transition::Applied);

        let status = rx.borrow_and_update().clone();
        assert_eq!(status.mode, Mode::Proxy);
        assert!(status.active_tunnels.is_empty());

        let mut turned_off = engine.turned_off();
        turned_off.sort_by_key(|(_, handle)| *handle);
        assert_eq!(turned_off, vec![(Mode::Userspace, 1), (Mode::Userspace, 2)]);

        assert_eq!(backend.set_mode(Mode::Proxy).await, Transition::Unchanged);

        // Tunnels started afterwards run under the new mode
        backend
            .start(Tunnel::new(1, "home"), "", listener)
            .await
            .unwrap();
        assert_eq!(engine.turned_on().last().unwrap().0, Mode::Proxy);
    }

    #[tokio::test]
    async fn test_stale_status_task_does_not_resurrect_tunnel() {
        let (engine, backend) = backend();
        engine.script_handle(4);
        backend
            .start(Tunnel::new(1, "home"), "", Arc::new(LoggingListener))
            .await
            .unwrap();
        backend.stop(1).await;

        assert!(!engine.emit_status(4, 0));
        tokio::task::yield_now().await;
        assert!(!backend.status().is_active(1));
    }

    #[tokio::test]
    async fn test_kill_switch_no_op_skips_engine() {
        let (engine, backend) = backend();
        let enabled = KillSwitchSettings {
            enabled: true,
            bypass_lan: false,
        };

        assert_eq!(backend.set_kill_switch(enabled).await, Ok(Transition::Applied));
        assert!(backend.status().kill_switch_enabled);
        assert_eq!(engine.kill_switch_calls(), 1);

        assert_eq!(
            backend.set_kill_switch(enabled).await,
            Ok(Transition::Unchanged)
        );
        assert_eq!(engine.kill_switch_calls(), 1);
    }

    #[tokio::test]
    async fn test_kill_switch_failure_keeps_published_state() {
        let (engine, backend) = backend();
        engine.script_kill_switch_result(-2);

        let result = backend
            .set_kill_switch(KillSwitchSettings {
                enabled: true,
                bypass_lan: true,
            })
            .await;

        assert_eq!(result, Err(BackendError::KillSwitchSetFailed(-2)));
        assert!(!backend.status().kill_switch_enabled);
        assert_eq!(backend.kill_switch().await, KillSwitchSettings::default());
    }

    #[tokio::test]
    async fn test_kill_switch_follows_engine_answer() {
        let (engine, backend) = backend();
        // Engine reports the kill switch as still disabled
        engine.script_kill_switch_result(0);

        let result = backend
            .set_kill_switch(KillSwitchSettings {
                enabled: true,
                bypass_lan: false,
            })
            .await;

        assert_eq!(result, Ok(Transition::Applied));
        assert!(!backend.status().kill_switch_enabled);
    }

    #[tokio::test]
    async fn test_shutdown_clears_everything() {
        let (engine, backend) = backend();
        let listener = Arc::new(RecordingListener::default());
        engine.script_handle(9);
        backend
            .start(Tunnel::new(1, "home"), "", listener.clone())
            .await
            .unwrap();

        backend.shutdown().await;
        backend.shutdown().await;

        assert!(backend.status().active_tunnels.is_empty());
        assert_eq!(engine.turned_off(), vec![(Mode::Userspace, 9)]);
        assert_eq!(listener.states().last(), Some(&TunnelState::Down));
    }
}
