//! IPC Message Definitions
//!
//! This module defines the data model shared by the daemon and its clients:
//! tunnel identities and states, the backend status snapshot, and the JSON
//! bodies exchanged on each route.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Numeric tunnel identifier, owned by the client-side tunnel store
pub type TunnelId = i32;

/// Optional capabilities a tunnel configuration makes use of
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    /// AmneziaWG obfuscation parameters are present
    Amnezia,
    /// The tunnel carries IPv6 traffic
    Ipv6,
    /// The tunnel overrides system DNS
    Dns,
}

impl std::str::FromStr for Feature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "amnezia" => Ok(Feature::Amnezia),
            "ipv6" => Ok(Feature::Ipv6),
            "dns" => Ok(Feature::Dns),
            other => Err(format!("unknown tunnel feature: {other}")),
        }
    }
}

/// Identity of a tunnel as seen by the backend
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tunnel {
    /// Stable identifier
    pub id: TunnelId,

    /// Display name, handed to the engine as the interface name
    pub name: String,

    /// Capabilities used by the tunnel's configuration
    #[serde(default)]
    pub features: BTreeSet<Feature>,
}

impl Tunnel {
    pub fn new(id: TunnelId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            features: BTreeSet::new(),
        }
    }
}

impl fmt::Display for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Health reported by the engine for a tunnel that is up
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelHealth {
    Healthy,
    ResolvingDns,
    HandshakeFailure,
    Unknown,
}

/// Lifecycle state of a single tunnel
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Down,
    Starting,
    Up(TunnelHealth),
}

impl TunnelState {
    pub fn is_up(&self) -> bool {
        matches!(self, TunnelState::Up(_))
    }
}

/// Process-wide engine operating mode
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Kernel-free userspace tunnel device
    #[default]
    Userspace,
    /// Local proxy endpoint instead of a tunnel device
    Proxy,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Userspace => write!(f, "userspace"),
            Mode::Proxy => write!(f, "proxy"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "userspace" => Ok(Mode::Userspace),
            "proxy" => Ok(Mode::Proxy),
            other => Err(format!("unknown backend mode: {other}")),
        }
    }
}

/// A tunnel currently tracked by the backend together with its state
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ActiveTunnel {
    pub tunnel: Tunnel,
    pub state: TunnelState,
}

/// Observable snapshot of the backend, published on every mutation
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    /// Kill switch state as last confirmed by the engine
    pub kill_switch_enabled: bool,

    /// Current operating mode
    pub mode: Mode,

    /// Tunnels the backend is tracking, keyed by tunnel id
    pub active_tunnels: BTreeMap<TunnelId, ActiveTunnel>,
}

impl BackendStatus {
    /// State of the given tunnel, if the backend is tracking it
    pub fn state_of(&self, id: TunnelId) -> Option<TunnelState> {
        self.active_tunnels.get(&id).map(|active| active.state)
    }

    pub fn is_active(&self, id: TunnelId) -> bool {
        self.active_tunnels.contains_key(&id)
    }
}

/// Durable kill switch preferences
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct KillSwitchSettings {
    pub enabled: bool,
    pub bypass_lan: bool,
}

/// The tunnel the daemon last started, kept for boot-time restoration
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LastActiveTunnel {
    pub tunnel: Tunnel,
    pub quick_config: String,
}

/// Daemon-owned settings that survive restarts
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DaemonCacheData {
    /// Kill switch preferences applied through the daemon
    pub kill_switch: KillSwitchSettings,

    /// Names of tunnels started through the daemon and not yet stopped
    pub start_configs: BTreeSet<String>,

    /// Re-apply the kill switch when the daemon boots
    pub restore_kill_switch_on_boot: bool,

    /// Restart the last active tunnel when the daemon boots
    pub restore_tunnel_on_boot: bool,

    /// Last tunnel successfully started through the daemon
    pub last_active_tunnel: Option<LastActiveTunnel>,
}

/// Body of `POST /tunnel/{id}/start`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StartTunnelRequest {
    pub name: String,
    pub quick_config: String,
    #[serde(default)]
    pub features: BTreeSet<Feature>,
}

/// Body of `PUT /backend/kill-switch`
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KillSwitchRequest {
    pub enable: bool,
    #[serde(default)]
    pub bypass_lan: bool,
}

/// Body of `PUT /daemon/settings`; absent fields are left unchanged
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSettingsRequest {
    #[serde(default)]
    pub restore_kill_switch_on_boot: Option<bool>,
    #[serde(default)]
    pub restore_tunnel_on_boot: Option<bool>,
}

/// Body of `GET /daemon/status`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DaemonHealth {
    pub status: String,
    pub version: String,
}

/// Error body returned by every failing route
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
    pub code: u16,
}
