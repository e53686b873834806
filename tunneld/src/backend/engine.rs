//! Tunnel engine capability
//!
//! The packet-forwarding engine is a native library with an integer ABI.
//! This module defines the trait the backend drives it through and the
//! mapping from its status codes to [`TunnelState`].

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::warn;
use tunneld_ipc::{Mode, TunnelHealth, TunnelState};

/// Engine handle for a running tunnel; negative values signal failure
pub type EngineHandle = i32;

/// Native tunnel engine
#[async_trait]
pub trait TunnelEngine: Send + Sync {
    /// Bring a tunnel up. Returns its handle, or a negative value on failure.
    async fn turn_on(&self, mode: Mode, name: &str, quick_config: &str) -> EngineHandle;

    /// Tear down the tunnel behind `handle`
    async fn turn_off(&self, mode: Mode, handle: EngineHandle);

    /// Status codes reported by the engine for `handle`, in engine order.
    /// The stream ends when the engine stops reporting.
    async fn status_updates(&self, mode: Mode, handle: EngineHandle) -> BoxStream<'static, i32>;

    /// Apply the kill switch. Returns a negative value on failure, otherwise
    /// `1` if the kill switch is now enabled and `0` if it is disabled.
    async fn set_kill_switch(&self, enabled: bool, bypass_lan: bool) -> i32;
}

/// Map an engine status code to a tunnel state. Unknown codes mean the
/// tunnel is down.
pub fn state_from_code(code: i32) -> TunnelState {
    match code {
        0 => TunnelState::Up(TunnelHealth::Healthy),
        1 => TunnelState::Up(TunnelHealth::ResolvingDns),
        2 => TunnelState::Up(TunnelHealth::HandshakeFailure),
        3 => TunnelState::Up(TunnelHealth::Unknown),
        other => {
            warn!(code = other, "Unmapped engine status code, treating tunnel as down");
            TunnelState::Down
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(state_from_code(0), TunnelState::Up(TunnelHealth::Healthy));
        assert_eq!(
            state_from_code(1),
            TunnelState::Up(TunnelHealth::ResolvingDns)
        );
        assert_eq!(
            state_from_code(2),
            TunnelState::Up(TunnelHealth::HandshakeFailure)
        );
        assert_eq!(state_from_code(3), TunnelState::Up(TunnelHealth::Unknown));
        assert_eq!(state_from_code(4), TunnelState::Down);
        assert_eq!(state_from_code(-1), TunnelState::Down);
    }
}
