//! Scripted daemon used by the client tests

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::sync::Mutex;
use tunneld_ipc::messages::{DaemonHealth, RestoreSettingsRequest};
use tunneld_ipc::{
    BackendStatus, DaemonApi, DaemonCacheData, DaemonError, DaemonResult, KillSwitchSettings,
    Mode, Tunnel, TunnelId,
};

#[derive(Default)]
pub struct MockState {
    pub calls: Vec<String>,
    pub start_results: VecDeque<DaemonResult<()>>,
    pub stop_results: VecDeque<DaemonResult<()>>,
    pub kill_switch_results: VecDeque<DaemonResult<()>>,
    pub status_results: VecDeque<DaemonResult<BackendStatus>>,
    pub subscriptions: VecDeque<Vec<DaemonResult<BackendStatus>>>,
    pub status: BackendStatus,
}

#[derive(Default)]
pub struct MockDaemon {
    pub state: Mutex<MockState>,
}

impl MockDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn calls(&self) -> Vec<String> {
        self.with(|state| state.calls.clone())
    }

    fn record(&self, call: String) {
        self.with(|state| state.calls.push(call));
    }
}

pub fn comms() -> DaemonError {
    DaemonError::Comms("connection refused".into())
}

#[async_trait]
impl DaemonApi for MockDaemon {
    async fn daemon_status(&self) -> DaemonResult<DaemonHealth> {
        self.record("daemon_status".into());
        Ok(DaemonHealth {
            status: "ok".into(),
            version: "test".into(),
        })
    }

    async fn backend_status(&self) -> DaemonResult<BackendStatus> {
        self.record("backend_status".into());
        self.with(|state| {
            state
                .status_results
                .pop_front()
                .unwrap_or_else(|| Ok(state.status.clone()))
        })
    }

    async fn subscribe_backend_status(
        &self,
    ) -> DaemonResult<BoxStream<'static, DaemonResult<BackendStatus>>> {
        self.record("subscribe".into());
        Ok(match self.with(|state| state.subscriptions.pop_front()) {
            Some(items) => stream::iter(items).boxed(),
            None => stream::pending::<DaemonResult<BackendStatus>>().boxed(),
        })
    }

    async fn start_tunnel(&self, tunnel: &Tunnel, _quick_config: &str) -> DaemonResult<()> {
        self.record(format!("start:{}", tunnel.id));
        self.with(|state| state.start_results.pop_front().unwrap_or(Ok(())))
    }

    async fn stop_tunnel(&self, id: TunnelId) -> DaemonResult<()> {
        self.record(format!("stop:{id}"));
        self.with(|state| state.stop_results.pop_front().unwrap_or(Ok(())))
    }

    async fn set_mode(&self, mode: Mode) -> DaemonResult<()> {
        self.record(format!("mode:{mode}"));
        Ok(())
    }

    async fn set_kill_switch(&self, settings: KillSwitchSettings) -> DaemonResult<()> {
        self.record(format!("kill_switch:{}", settings.enabled));
        self.with(|state| state.kill_switch_results.pop_front().unwrap_or(Ok(())))
    }

    async fn settings(&self) -> DaemonResult<DaemonCacheData> {
        Ok(DaemonCacheData::default())
    }

    async fn update_settings(
        &self,
        _update: RestoreSettingsRequest,
    ) -> DaemonResult<DaemonCacheData> {
        Ok(DaemonCacheData::default())
    }
}
