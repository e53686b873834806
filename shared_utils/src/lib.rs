//! Shared utilities for the tunneld components.
//!
//! This crate provides the configuration model and logging setup used by
//! both the privileged daemon and the unprivileged client tooling.

pub mod config;
pub mod logging;

// Re-export commonly used types for convenience
pub use config::{ClientConfig, Config, ConfigError, DaemonConfig, TunnelEntry};
