//! tunneld IPC Protocol Library
//!
//! This crate defines the contract between the unprivileged client tooling
//! and the privileged tunnel daemon: the shared data model, the signed
//! request envelope, per-user secret provisioning, and the client side of
//! the HTTP/WebSocket transport carried over the daemon's Unix socket.

pub mod auth;
pub mod messages;
pub mod secret;
pub mod transport;

/// Re-export common types for convenience
pub use auth::{AuthError, RequestAuthenticator, SecureCommand};
pub use messages::{
    ActiveTunnel, BackendStatus, DaemonCacheData, Feature, KillSwitchSettings, Mode, Tunnel,
    TunnelHealth, TunnelId, TunnelState,
};
pub use secret::{FileSecretStore, SecretError, SecretStore};
pub use transport::{DaemonApi, DaemonClient, DaemonError, DaemonResult};
