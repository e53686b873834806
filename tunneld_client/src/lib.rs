//! tunneld client library
//!
//! Everything an unprivileged front end needs to drive the daemon: the
//! local tunnel store, the command service that keeps at most one tunnel
//! active, and a self-healing backend status stream.

pub mod command_service;
pub mod repository;
pub mod status_stream;

pub use command_service::{ClientCommandService, CommandError, CommandResult};
pub use repository::{InMemoryTunnelRepository, StoredTunnel, TunnelRepository};
pub use status_stream::StatusStream;
