//! Per-user shared secrets for request signing.
//!
//! Every client user owns a 32-byte secret stored under their home
//! directory. The client creates it on first use; the daemon, running as a
//! privileged account, reads it back by username to verify requests.

use rand::RngCore;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[cfg(unix)]
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

/// Directory under a user's home holding tunneld client state
pub const SECRET_DIR: &str = ".tunneld";

/// File name of the per-user secret
pub const SECRET_FILE: &str = "ipc.key";

/// Length of a generated secret in bytes
pub const SECRET_LEN: usize = 32;

/// Result type for secret operations
pub type SecretResult<T> = Result<T, SecretError>;

/// Error type for secret provisioning
#[derive(Error, Debug)]
pub enum SecretError {
    /// I/O error
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The home directory of the current user could not be determined
    #[error("could not determine the home directory of the current user")]
    NoHomeDirectory,

    /// The secret file exists but holds no key material
    #[error("secret file {0} is empty")]
    Empty(PathBuf),
}

impl SecretError {
    fn io(path: &Path, source: io::Error) -> Self {
        SecretError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Source of the shared secrets used to sign and verify requests
pub trait SecretStore: Send + Sync {
    /// Return the calling user's secret, generating and persisting it first
    /// if it does not exist yet.
    fn get_or_create_local_secret(&self) -> SecretResult<Vec<u8>>;

    /// Look up the secret of `username`. Never fails loudly: malformed
    /// names, missing files and unreadable files all yield `None`.
    fn resolve_secret_for_user(&self, username: &str) -> Option<Vec<u8>>;
}

/// Usernames are restricted to `[A-Za-z0-9._-]` before they are ever used to build a path.
pub fn is_valid_username(username: &str) -> bool {
    !username.is_empty()
        && username.len() <= 64
        && !username.chars().all(|c| c == '.')
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Name of the user this process runs as
pub fn current_username() -> Option<String> {
    #[cfg(unix)]
    {
        if let Ok(Some(user)) = nix::unistd::User::from_uid(nix::unistd::getuid()) {
            return Some(user.name);
        }
    }
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok()
        .filter(|name| is_valid_username(name))
}

#[derive(Debug, Clone)]
enum HomeLookup {
    /// Resolve homes through the system user database
    System,
    /// Treat `<root>/<username>` as each user's home
    Root(PathBuf),
}

/// File-backed [`SecretStore`]
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    local_path: PathBuf,
    homes: HomeLookup,
}

impl FileSecretStore {
    /// Store whose local secret lives at `local_path`; other users are
    /// resolved through the system user database.
    pub fn new(local_path: impl Into<PathBuf>) -> Self {
        Self {
            local_path: local_path.into(),
            homes: HomeLookup::System,
        }
    }

    /// Store for the current user at the default location (`~/.tunneld/ipc.key`)
    pub fn for_current_user() -> SecretResult<Self> {
        let home = dirs::home_dir().ok_or(SecretError::NoHomeDirectory)?;
        Ok(Self::new(secret_path_in(&home)))
    }

    /// Store that resolves every user's home as `<root>/<username>`
    pub fn with_home_root(local_path: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self {
            local_path: local_path.into(),
            homes: HomeLookup::Root(root.into()),
        }
    }

    /// Path of the calling user's secret file
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    fn home_of(&self, username: &str) -> Option<PathBuf> {
        match &self.homes {
            HomeLookup::Root(root) => Some(root.join(username)),
            HomeLookup::System => system_home_of(username),
        }
    }

    fn create_secret(&self) -> SecretResult<Option<Vec<u8>>> {
        if let Some(parent) = self.local_path.parent() {
            let mut builder = fs::DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            builder.mode(0o700);
            builder
                .create(parent)
                .map_err(|e| SecretError::io(parent, e))?;
        }

        let mut secret = vec![0u8; SECRET_LEN];
        rand::rng().fill_bytes(&mut secret);

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = match options.open(&self.local_path) {
            Ok(file) => file,
            // Another process of the same user won the race; use its secret
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(SecretError::io(&self.local_path, e)),
        };
        file.write_all(&secret)
            .and_then(|_| file.sync_all())
            .map_err(|e| SecretError::io(&self.local_path, e))?;

        info!(path = %self.local_path.display(), "Provisioned new IPC secret");
        Ok(Some(secret))
    }
}

impl SecretStore for FileSecretStore {
    fn get_or_create_local_secret(&self) -> SecretResult<Vec<u8>> {
        if !self.local_path.exists() {
            if let Some(secret) = self.create_secret()? {
                return Ok(secret);
            }
        }

        let secret =
            fs::read(&self.local_path).map_err(|e| SecretError::io(&self.local_path, e))?;
        if secret.is_empty() {
            return Err(SecretError::Empty(self.local_path.clone()));
        }
        Ok(secret)
    }

    fn resolve_secret_for_user(&self, username: &str) -> Option<Vec<u8>> {
        if !is_valid_username(username) {
            debug!("Rejecting malformed username in request envelope");
            return None;
        }

        let path = secret_path_in(&self.home_of(username)?);
        match fs::read(&path) {
            Ok(secret) if !secret.is_empty() => Some(secret),
            Ok(_) => {
                debug!(user = username, "Secret file is empty");
                None
            }
            Err(e) => {
                debug!(user = username, path = %path.display(), "No readable secret: {e}");
                None
            }
        }
    }
}

fn secret_path_in(home: &Path) -> PathBuf {
    home.join(SECRET_DIR).join(SECRET_FILE)
}

#[cfg(unix)]
fn system_home_of(username: &str) -> Option<PathBuf> {
    match nix::unistd::User::from_name(username) {
        Ok(Some(user)) => Some(user.dir),
        Ok(None) => None,
        Err(e) => {
            debug!(user = username, "User database lookup failed: {e}");
            None
        }
    }
}

#[cfg(not(unix))]
fn system_home_of(username: &str) -> Option<PathBuf> {
    dirs::home_dir()
        .and_then(|home| home.parent().map(|users| users.join(username)))
}
