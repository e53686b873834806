//! Local tunnel store
//!
//! Holds the tunnels a user has configured, their quick configs, and the
//! client's own view of which one is active.

use async_trait::async_trait;
use shared_utils::TunnelEntry;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;
use tracing::warn;
use tunneld_ipc::{Feature, KillSwitchSettings, Tunnel, TunnelId};

/// A configured tunnel and its local activity flag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTunnel {
    pub tunnel: Tunnel,
    pub quick_config: String,
    pub active: bool,
}

impl StoredTunnel {
    pub fn new(tunnel: Tunnel, quick_config: impl Into<String>) -> Self {
        Self {
            tunnel,
            quick_config: quick_config.into(),
            active: false,
        }
    }
}

impl From<&TunnelEntry> for StoredTunnel {
    fn from(entry: &TunnelEntry) -> Self {
        let features: BTreeSet<Feature> = entry
            .features
            .iter()
            .filter_map(|name| match name.parse() {
                Ok(feature) => Some(feature),
                Err(e) => {
                    warn!(tunnel_id = entry.id, "Ignoring feature: {e}");
                    None
                }
            })
            .collect();

        Self::new(
            Tunnel {
                id: entry.id,
                name: entry.name.clone(),
                features,
            },
            entry.quick_config.clone(),
        )
    }
}

/// Client-side tunnel persistence
#[async_trait]
pub trait TunnelRepository: Send + Sync {
    async fn get(&self, id: TunnelId) -> Option<StoredTunnel>;

    async fn list(&self) -> Vec<StoredTunnel>;

    /// Set the local activity flag; unknown ids are ignored
    async fn set_active(&self, id: TunnelId, active: bool);

    async fn kill_switch(&self) -> KillSwitchSettings;

    async fn set_kill_switch(&self, settings: KillSwitchSettings);
}

#[derive(Default)]
struct RepositoryState {
    tunnels: BTreeMap<TunnelId, StoredTunnel>,
    kill_switch: KillSwitchSettings,
}

/// [`TunnelRepository`] kept in memory, seeded from configuration
#[derive(Default)]
pub struct InMemoryTunnelRepository {
    state: RwLock<RepositoryState>,
}

impl InMemoryTunnelRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: &[TunnelEntry]) -> Self {
        let tunnels = entries
            .iter()
            .map(|entry| (entry.id, StoredTunnel::from(entry)))
            .collect();
        Self {
            state: RwLock::new(RepositoryState {
                tunnels,
                kill_switch: KillSwitchSettings::default(),
            }),
        }
    }

    pub async fn insert(&self, tunnel: StoredTunnel) {
        self.state
            .write()
            .await
            .tunnels
            .insert(tunnel.tunnel.id, tunnel);
    }

    /// Ids currently flagged active
    pub async fn active_ids(&self) -> Vec<TunnelId> {
        self.state
            .read()
            .await
            .tunnels
            .values()
            .filter(|stored| stored.active)
            .map(|stored| stored.tunnel.id)
            .collect()
    }
}

#[async_trait]
impl TunnelRepository for InMemoryTunnelRepository {
    async fn get(&self, id: TunnelId) -> Option<StoredTunnel> {
        self.state.read().await.tunnels.get(&id).cloned()
    }

    async fn list(&self) -> Vec<StoredTunnel> {
        self.state.read().await.tunnels.values().cloned().collect()
    }

    async fn set_active(&self, id: TunnelId, active: bool) {
        if let Some(stored) = self.state.write().await.tunnels.get_mut(&id) {
            stored.active = active;
        }
    }

    async fn kill_switch(&self) -> KillSwitchSettings {
        self.state.read().await.kill_switch
    }

    async fn set_kill_switch(&self, settings: KillSwitchSettings) {
        self.state.write().await.kill_switch = settings;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seeded_from_config_entries() {
        let entries = vec![
            TunnelEntry {
                id: 1,
                name: "home".into(),
                quick_config: "[Interface]".into(),
                features: vec!["ipv6".into(), "warp".into()],
            },
            TunnelEntry {
                id: 2,
                name: "work".into(),
                quick_config: String::new(),
                features: Vec::new(),
            },
        ];
        let repository = InMemoryTunnelRepository::from_entries(&entries);

        let home = repository.get(1).await.unwrap();
        assert_eq!(home.tunnel.name, "home");
        assert_eq!(
            home.tunnel.features.into_iter().collect::<Vec<_>>(),
            vec![Feature::Ipv6]
        );
        assert!(!home.active);
        assert_eq!(repository.list().await.len(), 2);
    }

    #[tokio::test]
    async fn test_active_flags() {
        let repository = InMemoryTunnelRepository::new();
        repository
            .insert(StoredTunnel::new(Tunnel::new(5, "lab"), ""))
            .await;

        repository.set_active(5, true).await;
        repository.set_active(99, true).await;
        assert_eq!(repository.active_ids().await, vec![5]);

        repository.set_active(5, false).await;
        assert!(repository.active_ids().await.is_empty());
    }
}
