//! tunneld daemon library
//!
//! The privileged half of the tunnel manager: the backend state machine
//! around the tunnel engine, durable daemon settings, socket provisioning,
//! and the signed HTTP/WebSocket server that exposes them.

pub mod backend;
pub mod server;
pub mod settings;
pub mod socket;

pub use backend::{
    BackendError, BackendResult, DryRunEngine, LoggingListener, Transition, TunnelBackend,
    TunnelEngine, TunnelStateListener,
};
pub use server::{ApiError, DaemonServer, ServerError};
pub use settings::{DaemonSettingsCache, SettingsError};
pub use socket::{RetryPolicy, SocketProvisioner};
