//! Durable daemon settings
//!
//! A single JSON document under the daemon's settings directory. Every
//! update is a read-modify-write of the whole document, written to a
//! temporary file and renamed into place.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use tunneld_ipc::messages::{LastActiveTunnel, RestoreSettingsRequest};
use tunneld_ipc::{DaemonCacheData, KillSwitchSettings, Tunnel};

pub const SETTINGS_FILE: &str = "settings.json";

/// Result type for settings operations
pub type SettingsResult<T> = Result<T, SettingsError>;

/// Error type for settings operations
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode settings: {0}")]
    Encode(#[from] serde_json::Error),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> SettingsError + '_ {
    move |source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// File-backed store for [`DaemonCacheData`]
#[derive(Debug)]
pub struct DaemonSettingsCache {
    dir: PathBuf,
    path: PathBuf,
    lock: Mutex<()>,
}

impl DaemonSettingsCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let path = dir.join(SETTINGS_FILE);
        Self {
            dir,
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current settings; defaults when the file is missing or empty
    pub async fn load(&self) -> SettingsResult<DaemonCacheData> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    /// Apply `change` to the stored document and persist the result
    pub async fn update<F>(&self, change: F) -> SettingsResult<DaemonCacheData>
    where
        F: FnOnce(&mut DaemonCacheData),
    {
        let _guard = self.lock.lock().await;
        let mut data = self.read().await?;
        change(&mut data);
        self.write(&data).await?;
        Ok(data)
    }

    pub async fn kill_switch(&self) -> SettingsResult<KillSwitchSettings> {
        Ok(self.load().await?.kill_switch)
    }

    pub async fn set_kill_switch(&self, settings: KillSwitchSettings) -> SettingsResult<()> {
        self.update(|data| data.kill_switch = settings).await?;
        Ok(())
    }

    pub async fn set_restore_flags(
        &self,
        request: RestoreSettingsRequest,
    ) -> SettingsResult<DaemonCacheData> {
        self.update(|data| {
            if let Some(restore) = request.restore_kill_switch_on_boot {
                data.restore_kill_switch_on_boot = restore;
            }
            if let Some(restore) = request.restore_tunnel_on_boot {
                data.restore_tunnel_on_boot = restore;
            }
        })
        .await
    }

    pub async fn record_tunnel_started(
        &self,
        tunnel: &Tunnel,
        quick_config: &str,
    ) -> SettingsResult<()> {
        self.update(|data| {
            data.start_configs.insert(tunnel.name.clone());
            data.last_active_tunnel = Some(LastActiveTunnel {
                tunnel: tunnel.clone(),
                quick_config: quick_config.to_string(),
            });
        })
        .await?;
        Ok(())
    }

    pub async fn record_tunnel_stopped(&self, tunnel: &Tunnel) -> SettingsResult<()> {
        self.update(|data| {
            data.start_configs.remove(&tunnel.name);
            if data
                .last_active_tunnel
                .as_ref()
                .is_some_and(|last| last.tunnel.id == tunnel.id)
            {
                data.last_active_tunnel = None;
            }
        })
        .await?;
        Ok(())
    }

    async fn read(&self) -> SettingsResult<DaemonCacheData> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(file = %self.path.display(), "No settings file, using defaults");
                return Ok(DaemonCacheData::default());
            }
            Err(e) => return Err(io_error(&self.path)(e)),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(DaemonCacheData::default());
        }
        match serde_json::from_slice(&bytes) {
            Ok(data) => Ok(data),
            Err(e) => {
                error!(file = %self.path.display(), "Unreadable settings file, using defaults: {e}");
                Ok(DaemonCacheData::default())
            }
        }
    }

    async fn write(&self, data: &DaemonCacheData) -> SettingsResult<()> {
        self.ensure_dir().await?;
        let serialized = serde_json::to_vec_pretty(data)?;

        let tmp = self.path.with_extension("json.tmp");
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&tmp).await.map_err(io_error(&tmp))?;
        file.write_all(&serialized).await.map_err(io_error(&tmp))?;
        file.sync_all().await.map_err(io_error(&tmp))?;
        drop(file);

        fs::rename(&tmp, &self.path)
            .await
            .map_err(io_error(&self.path))?;
        Ok(())
    }

    async fn ensure_dir(&self) -> SettingsResult<()> {
        if !fs::try_exists(&self.dir).await.unwrap_or(false) {
            fs::create_dir_all(&self.dir)
                .await
                .map_err(io_error(&self.dir))?;
            info!(dir = %self.dir.display(), "Created settings directory");
        }
        // The directory is daemon-owned; tighten it even if it was pre-created
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o700))
                .await
                .map_err(io_error(&self.dir))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_and_empty_file_yield_defaults() {
        let dir = tempdir().unwrap();
        let cache = DaemonSettingsCache::new(dir.path().join("state"));
        assert_eq!(cache.load().await.unwrap(), DaemonCacheData::default());

        std::fs::create_dir_all(dir.path().join("state")).unwrap();
        std::fs::write(cache.path(), b"  \n").unwrap();
        assert_eq!(cache.load().await.unwrap(), DaemonCacheData::default());
    }

    #[tokio::test]
    async fn test_updates_survive_reopen() {
        let dir = tempdir().unwrap();
        let cache = DaemonSettingsCache::new(dir.path());
        let settings = KillSwitchSettings {
            enabled: true,
            bypass_lan: true,
        };
        cache.set_kill_switch(settings).await.unwrap();
        cache
            .set_restore_flags(RestoreSettingsRequest {
                restore_kill_switch_on_boot: Some(true),
                restore_tunnel_on_boot: None,
            })
            .await
            .unwrap();

        let reopened = DaemonSettingsCache::new(dir.path());
        let data = reopened.load().await.unwrap();
        assert_eq!(data.kill_switch, settings);
        assert!(data.restore_kill_switch_on_boot);
        assert!(!data.restore_tunnel_on_boot);
        assert!(!dir.path().join("settings.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_tunnel_bookkeeping() {
        let dir = tempdir().unwrap();
        let cache = DaemonSettingsCache::new(dir.path());
        let home = Tunnel::new(1, "home");
        let work = Tunnel::new(2, "work");

        cache.record_tunnel_started(&home, "[Interface]").await.unwrap();
        cache.record_tunnel_started(&work, "[Interface]\n").await.unwrap();
        cache.record_tunnel_stopped(&home).await.unwrap();

        let data = cache.load().await.unwrap();
        assert_eq!(data.start_configs.iter().collect::<Vec<_>>(), vec!["work"]);
        assert_eq!(data.last_active_tunnel.unwrap().tunnel, work);

        cache.record_tunnel_stopped(&work).await.unwrap();
        let data = cache.load().await.unwrap();
        assert!(data.start_configs.is_empty());
        assert!(data.last_active_tunnel.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_permissions_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let settings_dir = dir.path().join("tunneld");
        let cache = DaemonSettingsCache::new(&settings_dir);
        cache
            .set_kill_switch(KillSwitchSettings::default())
            .await
            .unwrap();

        let dir_mode = std::fs::metadata(&settings_dir).unwrap().permissions().mode();
        let file_mode = std::fs::metadata(cache.path()).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        assert_eq!(file_mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_precreated_directory_is_tightened() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let settings_dir = dir.path().join("tunneld");
        std::fs::create_dir(&settings_dir).unwrap();
        std::fs::set_permissions(&settings_dir, std::fs::Permissions::from_mode(0o755)).unwrap();

        let cache = DaemonSettingsCache::new(&settings_dir);
        cache
            .set_restore_flags(RestoreSettingsRequest {
                restore_kill_switch_on_boot: Some(true),
                restore_tunnel_on_boot: None,
            })
            .await
            .unwrap();

        let dir_mode = std::fs::metadata(&settings_dir).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let dir = tempdir().unwrap();
        let cache = std::sync::Arc::new(DaemonSettingsCache::new(dir.path()));

        let mut tasks = Vec::new();
        for id in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .record_tunnel_started(&Tunnel::new(id, format!("t{id}")), "")
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(cache.load().await.unwrap().start_configs.len(), 8);
    }
}
