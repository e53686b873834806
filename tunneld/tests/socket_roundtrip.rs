//! End-to-end tests over a real Unix socket with the signed client.

use futures::StreamExt;
use shared_utils::DaemonConfig;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tunneld::{DaemonServer, DaemonSettingsCache, DryRunEngine, LoggingListener, TunnelBackend};
use tunneld_ipc::messages::LastActiveTunnel;
use tunneld_ipc::{
    DaemonApi, DaemonCacheData, DaemonClient, DaemonError, FileSecretStore, KillSwitchSettings,
    Mode, SecretStore, Tunnel, TunnelHealth, TunnelState,
};

struct Daemon {
    dir: TempDir,
    config: DaemonConfig,
    engine: Arc<DryRunEngine>,
    server: Arc<DaemonServer>,
    client: DaemonClient,
}

fn daemon_in(dir: TempDir) -> Daemon {
    let homes = dir.path().join("home");
    let alice = FileSecretStore::with_home_root(
        homes.join("alice").join(".tunneld").join("ipc.key"),
        &homes,
    );
    let secret = alice.get_or_create_local_secret().unwrap();

    let config = DaemonConfig {
        socket_path: dir.path().join("run").join("daemon.sock"),
        settings_dir: dir.path().join("settings"),
        shutdown_grace_secs: 1,
        ..Default::default()
    };
    let engine = Arc::new(DryRunEngine::new());
    let server = Arc::new(DaemonServer::new(
        &config,
        Arc::new(TunnelBackend::new(engine.clone())),
        Arc::new(DaemonSettingsCache::new(&config.settings_dir)),
        Arc::new(FileSecretStore::with_home_root(
            dir.path().join("daemon.key"),
            &homes,
        )),
        Arc::new(LoggingListener),
    ));
    let client = DaemonClient::new(&config.socket_path, secret, "alice");

    Daemon {
        dir,
        config,
        engine,
        server,
        client,
    }
}

async fn timed<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("operation timed out")
}

#[tokio::test]
async fn client_drives_tunnel_lifecycle_over_socket() {
    let daemon = daemon_in(tempfile::tempdir().unwrap());
    daemon.server.start().await.unwrap();
    // Second start is a no-op
    daemon.server.start().await.unwrap();

    let health = timed(daemon.client.daemon_status()).await.unwrap();
    assert_eq!(health.status, "ok");

    let mut updates = timed(daemon.client.subscribe_backend_status())
        .await
        .unwrap();
    let initial = timed(updates.next()).await.unwrap().unwrap();
    assert!(initial.active_tunnels.is_empty());

    daemon.engine.script_handle(7);
    let home = Tunnel::new(1, "home");
    timed(daemon.client.start_tunnel(&home, "[Interface]"))
        .await
        .unwrap();
    assert!(daemon.engine.emit_status(7, 0));

    loop {
        let status = timed(updates.next()).await.unwrap().unwrap();
        if status.state_of(1) == Some(TunnelState::Up(TunnelHealth::Healthy)) {
            break;
        }
    }

    let conflict = timed(daemon.client.start_tunnel(&home, "[Interface]")).await;
    assert!(matches!(conflict, Err(DaemonError::Conflict(_))));

    timed(daemon.client.stop_tunnel(1)).await.unwrap();
    assert_eq!(daemon.engine.turned_off(), vec![(Mode::Userspace, 7)]);
    assert!(matches!(
        timed(daemon.client.stop_tunnel(1)).await,
        Err(DaemonError::Conflict(_))
    ));

    timed(daemon.client.set_mode(Mode::Proxy)).await.unwrap();
    let status = timed(daemon.client.backend_status()).await.unwrap();
    assert_eq!(status.mode, Mode::Proxy);

    let enable = KillSwitchSettings {
        enabled: true,
        bypass_lan: false,
    };
    timed(daemon.client.set_kill_switch(enable)).await.unwrap();
    assert!(matches!(
        timed(daemon.client.set_kill_switch(enable)).await,
        Err(DaemonError::BadRequest(_))
    ));

    daemon.server.stop().await;
}

#[tokio::test]
async fn wrong_secret_is_unauthorized() {
    let daemon = daemon_in(tempfile::tempdir().unwrap());
    daemon.server.start().await.unwrap();

    let impostor = DaemonClient::new(&daemon.config.socket_path, b"guessed".to_vec(), "alice");
    assert_eq!(
        timed(impostor.backend_status()).await,
        Err(DaemonError::Unauthorized)
    );
    assert!(matches!(
        timed(impostor.subscribe_backend_status()).await,
        Err(DaemonError::Unauthorized)
    ));

    daemon.server.stop().await;
}

#[tokio::test]
async fn stop_tears_down_tunnels_and_releases_everything() {
    let daemon = daemon_in(tempfile::tempdir().unwrap());
    daemon.server.start().await.unwrap();

    daemon.engine.script_handle(3);
    timed(daemon.client.start_tunnel(&Tunnel::new(4, "work"), ""))
        .await
        .unwrap();

    let liveness = tokio::spawn({
        let client = daemon.client.clone();
        async move { client.wait_for_shutdown().await }
    });
    // Let the liveness socket connect before stopping
    tokio::time::sleep(Duration::from_millis(100)).await;

    let waiter = tokio::spawn({
        let server = daemon.server.clone();
        async move { server.wait().await }
    });

    timed(daemon.server.stop()).await;
    timed(daemon.server.stop()).await;

    timed(waiter).await.unwrap();
    assert_eq!(timed(liveness).await.unwrap(), Ok(()));
    assert_eq!(daemon.engine.turned_off(), vec![(Mode::Userspace, 3)]);
    assert!(!daemon.config.socket_path.exists());
    assert!(daemon.server.start().await.is_err());

    // The daemon's own shutdown keeps the boot-restore record
    let settings = DaemonSettingsCache::new(daemon.dir.path().join("settings"))
        .load()
        .await
        .unwrap();
    assert!(settings.start_configs.contains("work"));
}

#[tokio::test]
async fn boot_restores_kill_switch_and_last_tunnel() {
    let dir = tempfile::tempdir().unwrap();
    let cache = DaemonSettingsCache::new(dir.path().join("settings"));
    cache
        .update(|data: &mut DaemonCacheData| {
            data.restore_kill_switch_on_boot = true;
            data.restore_tunnel_on_boot = true;
            data.kill_switch = KillSwitchSettings {
                enabled: true,
                bypass_lan: true,
            };
            data.last_active_tunnel = Some(LastActiveTunnel {
                tunnel: Tunnel::new(9, "office"),
                quick_config: "[Interface]".to_string(),
            });
        })
        .await
        .unwrap();

    let daemon = daemon_in(dir);
    daemon.server.start().await.unwrap();

    let status = timed(daemon.client.backend_status()).await.unwrap();
    assert!(status.kill_switch_enabled);
    assert!(status.is_active(9));
    assert_eq!(daemon.engine.turned_on(), vec![(Mode::Userspace, "office".to_string())]);
    assert_eq!(daemon.engine.kill_switch_calls(), 1);

    daemon.server.stop().await;
}

#[tokio::test]
async fn second_start_does_not_rebind_or_restore_again() {
    let dir = tempfile::tempdir().unwrap();
    let cache = DaemonSettingsCache::new(dir.path().join("settings"));
    cache
        .update(|data: &mut DaemonCacheData| {
            data.restore_kill_switch_on_boot = true;
            data.restore_tunnel_on_boot = true;
            data.kill_switch = KillSwitchSettings {
                enabled: true,
                bypass_lan: false,
            };
            data.last_active_tunnel = Some(LastActiveTunnel {
                tunnel: Tunnel::new(3, "cabin"),
                quick_config: "[Interface]".to_string(),
            });
        })
        .await
        .unwrap();

    let daemon = daemon_in(dir);
    daemon.server.start().await.unwrap();
    timed(daemon.client.daemon_status()).await.unwrap();

    daemon.server.start().await.unwrap();

    let health = timed(daemon.client.daemon_status()).await.unwrap();
    assert_eq!(health.status, "ok");
    let status = timed(daemon.client.backend_status()).await.unwrap();
    assert!(status.is_active(3));
    assert_eq!(daemon.engine.turned_on(), vec![(Mode::Userspace, "cabin".to_string())]);
    assert_eq!(daemon.engine.kill_switch_calls(), 1);

    daemon.server.stop().await;
}
