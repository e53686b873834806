//! Engine used when no native tunnel engine is linked.
//!
//! Hands out handles, records every call, and lets the caller inject status
//! codes per handle. The daemon runs on it in dry-run deployments and the
//! test suites script it directly.

use super::engine::{EngineHandle, TunnelEngine};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info};
use tunneld_ipc::Mode;

#[derive(Default)]
struct DryRunState {
    next_handle: EngineHandle,
    scripted_handles: VecDeque<EngineHandle>,
    scripted_kill_switch: VecDeque<i32>,
    report_healthy: bool,
    kill_switch_enabled: bool,
    senders: HashMap<EngineHandle, mpsc::UnboundedSender<i32>>,
    receivers: HashMap<EngineHandle, mpsc::UnboundedReceiver<i32>>,
    turned_on: Vec<(Mode, String)>,
    turned_off: Vec<(Mode, EngineHandle)>,
    kill_switch_calls: usize,
}

/// In-process [`TunnelEngine`] that never touches the network
#[derive(Default)]
pub struct DryRunEngine {
    state: Mutex<DryRunState>,
}

impl DryRunEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report every new tunnel as healthy as soon as it is turned on
    pub fn reporting_healthy(self) -> Self {
        self.lock().report_healthy = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, DryRunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return `handle` from the next `turn_on` call
    pub fn script_handle(&self, handle: EngineHandle) {
        self.lock().scripted_handles.push_back(handle);
    }

    /// Make the next `turn_on` call fail
    pub fn fail_next_start(&self) {
        self.script_handle(-1);
    }

    /// Return `result` from the next `set_kill_switch` call
    pub fn script_kill_switch_result(&self, result: i32) {
        self.lock().scripted_kill_switch.push_back(result);
    }

    /// Deliver a status code for `handle`. Returns false once the handle
    /// has been turned off.
    pub fn emit_status(&self, handle: EngineHandle, code: i32) -> bool {
        match self.lock().senders.get(&handle) {
            Some(sender) => sender.send(code).is_ok(),
            None => false,
        }
    }

    pub fn turned_on(&self) -> Vec<(Mode, String)> {
        self.lock().turned_on.clone()
    }

    pub fn turned_off(&self) -> Vec<(Mode, EngineHandle)> {
        self.lock().turned_off.clone()
    }

    pub fn kill_switch_calls(&self) -> usize {
        self.lock().kill_switch_calls
    }
}

#[async_trait]
impl TunnelEngine for DryRunEngine {
    async fn turn_on(&self, mode: Mode, name: &str, _quick_config: &str) -> EngineHandle {
        let mut state = self.lock();
        state.turned_on.push((mode, name.to_string()));

        let handle = match state.scripted_handles.pop_front() {
            Some(handle) => handle,
            None => {
                state.next_handle += 1;
                state.next_handle
            }
        };
        if handle < 0 {
            debug!(name, handle, "Dry-run engine refusing tunnel");
            return handle;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if state.report_healthy {
            let _ = tx.send(0);
        }
        state.senders.insert(handle, tx);
        state.receivers.insert(handle, rx);
        info!(%mode, name, handle, "Dry-run tunnel up");
        handle
    }

    async fn turn_off(&self, mode: Mode, handle: EngineHandle) {
        let mut state = self.lock();
        state.turned_off.push((mode, handle));
        state.senders.remove(&handle);
        state.receivers.remove(&handle);
        info!(%mode, handle, "Dry-run tunnel down");
    }

    async fn status_updates(&self, _mode: Mode, handle: EngineHandle) -> BoxStream<'static, i32> {
        match self.lock().receivers.remove(&handle) {
            Some(rx) => stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|code| (code, rx))
            })
            .boxed(),
            None => stream::empty().boxed(),
        }
    }

    async fn set_kill_switch(&self, enabled: bool, bypass_lan: bool) -> i32 {
        let mut state = self.lock();
        state.kill_switch_calls += 1;
        if let Some(result) = state.scripted_kill_switch.pop_front() {
            return result;
        }
        state.kill_switch_enabled = enabled;
        debug!(enabled, bypass_lan, "Dry-run kill switch applied");
        i32::from(state.kill_switch_enabled)
    }
}
