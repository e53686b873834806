//! Socket provisioning
//!
//! Prepares the directory the daemon socket lives in and hardens the socket
//! file once the listener has created it.

use shared_utils::DaemonConfig;
use std::io;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(250),
            max_attempts: 25,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.socket_poll_initial_ms),
            max_delay: Duration::from_millis(config.socket_poll_max_ms),
            max_attempts: config.socket_poll_attempts,
        }
    }

    /// Delay before retry number `attempt` (zero based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Creates and secures the daemon's socket endpoint
pub struct SocketProvisioner;

impl SocketProvisioner {
    /// Create the socket's parent directory so that clients can reach it
    pub fn prepare_directory(socket_path: &Path) -> io::Result<()> {
        let Some(dir) = socket_path.parent() else {
            return Ok(());
        };
        // An existing directory may be shared (e.g. /tmp); leave its mode alone
        if dir.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(dir)?;
        info!(path = %dir.display(), "Created socket directory");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755))?;
        }

        #[cfg(windows)]
        grant_directory_access(dir);

        Ok(())
    }

    /// Remove a socket file left behind by a previous run
    pub fn remove_stale(socket_path: &Path) -> io::Result<()> {
        match std::fs::remove_file(socket_path) {
            Ok(()) => {
                debug!(path = %socket_path.display(), "Removed stale socket");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Wait for the socket file to appear, then open it to every local user.
    ///
    /// Returns false if it never appeared or could not be hardened; the
    /// daemon keeps running either way.
    pub async fn poll_until_ready(socket_path: &Path, policy: RetryPolicy) -> bool {
        for attempt in 0..policy.max_attempts {
            if tokio::fs::try_exists(socket_path).await.unwrap_or(false) {
                return match Self::harden_socket(socket_path) {
                    Ok(()) => {
                        debug!(path = %socket_path.display(), attempt, "Socket ready");
                        true
                    }
                    Err(e) => {
                        warn!(path = %socket_path.display(), "Failed to set socket permissions: {e}");
                        false
                    }
                };
            }
            tokio::time::sleep(policy.delay_for(attempt)).await;
        }

        warn!(
            path = %socket_path.display(),
            attempts = policy.max_attempts,
            "Socket did not appear, leaving permissions unchanged"
        );
        false
    }

    fn harden_socket(socket_path: &Path) -> io::Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o666))?;
        }
        #[cfg(windows)]
        grant_directory_access(socket_path);
        Ok(())
    }
}

/// Grant local users modify rights and SYSTEM/Administrators full control.
/// Failures are logged and otherwise ignored.
#[cfg(windows)]
fn grant_directory_access(path: &Path) {
    const GRANTS: [&str; 3] = [
        "*S-1-5-32-545:(OI)(CI)M",
        "*S-1-5-18:(OI)(CI)F",
        "*S-1-5-32-544:(OI)(CI)F",
    ];
    for grant in GRANTS {
        match std::process::Command::new("icacls")
            .arg(path)
            .args(["/grant", grant])
            .output()
        {
            Ok(output) if output.status.success() => {}
            Ok(output) => warn!(
                path = %path.display(),
                grant,
                "icacls failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => warn!(path = %path.display(), grant, "Could not run icacls: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for(1), Duration::from_millis(20));
        assert_eq!(policy.delay_for(4), Duration::from_millis(160));
        assert_eq!(policy.delay_for(5), Duration::from_millis(250));
        assert_eq!(policy.delay_for(24), Duration::from_millis(250));
    }

    #[cfg(unix)]
    #[test]
    fn test_prepare_directory_creates_parents() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let socket = dir.path().join("run").join("tunneld").join("daemon.sock");
        SocketProvisioner::prepare_directory(&socket).unwrap();

        let parent = socket.parent().unwrap();
        assert!(parent.is_dir());
        let mode = std::fs::metadata(parent).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[cfg(unix)]
    #[test]
    fn test_prepare_directory_keeps_existing_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let shared = dir.path().join("shared");
        std::fs::create_dir(&shared).unwrap();
        std::fs::set_permissions(&shared, std::fs::Permissions::from_mode(0o1777)).unwrap();

        SocketProvisioner::prepare_directory(&shared.join("tunneld.sock")).unwrap();

        let mode = std::fs::metadata(&shared).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o1777);
    }

    #[test]
    fn test_remove_stale_tolerates_missing_file() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");
        SocketProvisioner::remove_stale(&socket).unwrap();

        std::fs::write(&socket, b"").unwrap();
        SocketProvisioner::remove_stale(&socket).unwrap();
        assert!(!socket.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_poll_hardens_late_socket() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");

        let path = socket.clone();
        let binder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            tokio::net::UnixListener::bind(&path).unwrap()
        });

        assert!(SocketProvisioner::poll_until_ready(&socket, RetryPolicy::default()).await);
        let _listener = binder.await.unwrap();

        let mode = std::fs::metadata(&socket).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o666);
    }

    #[tokio::test]
    async fn test_poll_gives_up_after_bound() {
        let dir = tempdir().unwrap();
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            max_attempts: 3,
        };
        assert!(!SocketProvisioner::poll_until_ready(&dir.path().join("never.sock"), policy).await);
    }
}
