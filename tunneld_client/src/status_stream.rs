//! Self-healing backend status stream
//!
//! Pulls the current status once, then follows the daemon's push stream.
//! Any failure waits out a fixed backoff and starts the cycle again, so
//! consumers only ever see the latest known status, never a disconnect.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tunneld_ipc::{BackendStatus, DaemonApi, DaemonResult};

/// Handle to the background status task. Dropping it stops the task.
pub struct StatusStream {
    updates: watch::Receiver<Option<BackendStatus>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl StatusStream {
    pub fn spawn(api: Arc<dyn DaemonApi>, backoff: Duration) -> Self {
        let (tx, updates) = watch::channel(None);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(api, tx, backoff, cancel.clone()));
        Self {
            updates,
            cancel,
            task,
        }
    }

    /// Receiver of every status the stream learns about
    pub fn subscribe(&self) -> watch::Receiver<Option<BackendStatus>> {
        self.updates.clone()
    }

    pub fn latest(&self) -> Option<BackendStatus> {
        self.updates.borrow().clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for StatusStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    api: Arc<dyn DaemonApi>,
    tx: watch::Sender<Option<BackendStatus>>,
    backoff: Duration,
    cancel: CancellationToken,
) {
    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = follow(api.as_ref(), &tx) => outcome,
        };
        match outcome {
            Ok(()) => info!("Daemon closed the status stream, reconnecting"),
            Err(e) => warn!("Status stream interrupted: {e}; retrying in {backoff:?}"),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
    }
    debug!("Status stream cancelled");
}

async fn follow(
    api: &dyn DaemonApi,
    tx: &watch::Sender<Option<BackendStatus>>,
) -> DaemonResult<()> {
    let status = api.backend_status().await?;
    tx.send_replace(Some(status));

    let mut updates = api.subscribe_backend_status().await?;
    while let Some(update) = updates.next().await {
        tx.send_replace(Some(update?));
    }
    Ok(())
}
