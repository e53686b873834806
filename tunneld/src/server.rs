//! Daemon server
//!
//! Binds the signed HTTP/WebSocket API to the daemon socket. Every request
//! passes the authentication interceptor before it reaches a route; routes
//! translate into [`TunnelBackend`] calls and persist durable state through
//! [`DaemonSettingsCache`].

use crate::backend::{BackendError, Transition, TunnelBackend, TunnelStateListener};
use crate::settings::{DaemonSettingsCache, SettingsError};
use crate::socket::{RetryPolicy, SocketProvisioner};
use axum::body::{to_bytes, Body, Bytes};
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as RoutePath, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use shared_utils::DaemonConfig;
use std::any::Any;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UnixListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{debug, error, info, warn};
use tunneld_ipc::auth::{SIGNATURE_HEADER, TIMESTAMP_HEADER, USER_HEADER};
use tunneld_ipc::messages::{
    DaemonHealth, ErrorBody, KillSwitchRequest, RestoreSettingsRequest, StartTunnelRequest,
};
use tunneld_ipc::{
    BackendStatus, KillSwitchSettings, Mode, RequestAuthenticator, SecretStore, SecureCommand,
    Tunnel, TunnelId,
};

/// Largest request body the interceptor will buffer
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Error type for server lifecycle operations
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to prepare socket {path}: {source}")]
    Socket {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("daemon server has already been stopped")]
    Stopped,
}

/// Errors returned by route handlers
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("internal error")]
    Internal,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Backend(_) | ApiError::Settings(_) | ApiError::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {self}");
        }
        let body = ErrorBody {
            error: self.to_string(),
            code: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid body: {e}")))
}

#[derive(Clone)]
struct AppState {
    backend: Arc<TunnelBackend>,
    settings: Arc<DaemonSettingsCache>,
    authenticator: RequestAuthenticator,
    listener: Arc<dyn TunnelStateListener>,
    shutdown: CancellationToken,
}

fn envelope_header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, ApiError> {
    let value = headers.get(name).ok_or_else(|| {
        debug!(header = name, "Request without envelope header");
        ApiError::Unauthorized
    })?;
    value
        .to_str()
        .map_err(|_| ApiError::BadRequest(format!("header {name} is not valid text")))
}

/// Rebuild the signed envelope from the request headers and body
async fn read_envelope(headers: &HeaderMap, body: Body) -> Result<SecureCommand, ApiError> {
    let timestamp = envelope_header(headers, TIMESTAMP_HEADER)?
        .trim()
        .parse::<i64>()
        .map_err(|_| ApiError::BadRequest("timestamp is not an integer".into()))?;
    let signature = envelope_header(headers, SIGNATURE_HEADER)?.to_string();
    let user_hint = envelope_header(headers, USER_HEADER)?.to_string();

    let bytes = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ApiError::BadRequest(format!("unreadable body: {e}")))?;
    let payload = String::from_utf8(bytes.to_vec())
        .map_err(|_| ApiError::BadRequest("body is not valid UTF-8".into()))?;

    Ok(SecureCommand {
        timestamp,
        signature,
        user_hint,
        payload: Some(payload),
    })
}

/// Authentication interceptor placed in front of every route
async fn authenticate(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let (parts, body) = request.into_parts();
    let command = read_envelope(&parts.headers, body).await?;

    if let Err(reason) = state.authenticator.authenticate(&command) {
        warn!(
            method = %parts.method,
            path = %parts.uri.path(),
            user = %command.user_hint,
            "Rejected request: {reason}"
        );
        return Err(ApiError::Unauthorized);
    }

    let body = Body::from(command.payload.unwrap_or_default());
    Ok(next.run(Request::from_parts(parts, body)).await)
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!("Request handler panicked: {detail}");
    ApiError::Internal.into_response()
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/daemon/status", get(daemon_status))
        .route("/daemon/status/ws", get(daemon_status_ws))
        .route("/daemon/settings", get(get_settings).put(put_settings))
        .route("/backend/status", get(backend_status))
        .route("/backend/status/ws", get(backend_status_ws))
        .route("/backend/mode", put(set_mode))
        .route("/backend/kill-switch", put(set_kill_switch))
        .route("/tunnel/{id}/start", post(start_tunnel))
        .route("/tunnel/{id}/stop", post(stop_tunnel))
        .layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .layer(CatchPanicLayer::custom(panic_response))
        .with_state(state)
}

async fn daemon_status() -> Json<DaemonHealth> {
    Json(DaemonHealth {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn daemon_status_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let shutdown = state.shutdown.clone();
    ws.on_upgrade(move |socket| hold_until_shutdown(socket, shutdown))
}

async fn close_for_shutdown(socket: &mut WebSocket) {
    let frame = CloseFrame {
        code: close_code::AWAY,
        reason: "daemon shutting down".into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

/// Keep a liveness socket open until the daemon shuts down or the peer leaves
async fn hold_until_shutdown(mut socket: WebSocket, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                close_for_shutdown(&mut socket).await;
                break;
            }
            message = socket.recv() => match message {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn backend_status(State(state): State<AppState>) -> Json<BackendStatus> {
    Json(state.backend.status())
}

async fn backend_status_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let updates = state.backend.subscribe();
    let shutdown = state.shutdown.clone();
    ws.on_upgrade(move |socket| push_status(socket, updates, shutdown))
}

async fn send_status(socket: &mut WebSocket, status: &BackendStatus) -> bool {
    match serde_json::to_string(status) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            error!("Failed to encode backend status: {e}");
            false
        }
    }
}

/// Send the current snapshot, then one message per published change
async fn push_status(
    mut socket: WebSocket,
    mut updates: watch::Receiver<BackendStatus>,
    shutdown: CancellationToken,
) {
    let snapshot = updates.borrow_and_update().clone();
    if !send_status(&mut socket, &snapshot).await {
        return;
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                close_for_shutdown(&mut socket).await;
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                if !send_status(&mut socket, &snapshot).await {
                    break;
                }
            }
            message = socket.recv() => match message {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("Status subscriber disconnected");
}

async fn set_mode(State(state): State<AppState>, body: Bytes) -> Result<StatusCode, ApiError> {
    let mode: Mode = parse_body(&body)?;
    if state.backend.set_mode(mode).await == Transition::Unchanged {
        debug!(%mode, "Mode already active");
    }
    Ok(StatusCode::OK)
}

async fn set_kill_switch(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let request: KillSwitchRequest = parse_body(&body)?;
    let settings = KillSwitchSettings {
        enabled: request.enable,
        bypass_lan: request.bypass_lan,
    };

    match state.backend.set_kill_switch(settings).await? {
        Transition::Unchanged => Err(ApiError::BadRequest(
            "kill switch is already in the requested state".into(),
        )),
        Transition::Applied => {
            let applied = state.backend.kill_switch().await;
            if let Err(e) = state.settings.set_kill_switch(applied).await {
                error!("Failed to persist kill switch settings: {e}");
            }
            Ok(StatusCode::OK)
        }
    }
}

async fn start_tunnel(
    State(state): State<AppState>,
    RoutePath(id): RoutePath<TunnelId>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let request: StartTunnelRequest = parse_body(&body)?;
    let tunnel = Tunnel {
        id,
        name: request.name,
        features: request.features,
    };

    match state
        .backend
        .start(tunnel.clone(), &request.quick_config, state.listener.clone())
        .await?
    {
        Transition::Unchanged => Err(ApiError::Conflict(format!("tunnel {id} is already active"))),
        Transition::Applied => {
            if let Err(e) = state
                .settings
                .record_tunnel_started(&tunnel, &request.quick_config)
                .await
            {
                error!(tunnel_id = id, "Failed to record started tunnel: {e}");
            }
            Ok(StatusCode::OK)
        }
    }
}

async fn stop_tunnel(
    State(state): State<AppState>,
    RoutePath(id): RoutePath<TunnelId>,
) -> Result<StatusCode, ApiError> {
    let tunnel = state
        .backend
        .status()
        .active_tunnels
        .get(&id)
        .map(|active| active.tunnel.clone());

    match state.backend.stop(id).await {
        Transition::Unchanged => Err(ApiError::Conflict(format!("tunnel {id} is not active"))),
        Transition::Applied => {
            if let Some(tunnel) = tunnel {
                if let Err(e) = state.settings.record_tunnel_stopped(&tunnel).await {
                    error!(tunnel_id = id, "Failed to record stopped tunnel: {e}");
                }
            }
            Ok(StatusCode::OK)
        }
    }
}

async fn get_settings(State(state): State<AppState>) -> Result<Response, ApiError> {
    Ok(Json(state.settings.load().await?).into_response())
}

async fn put_settings(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let request: RestoreSettingsRequest = parse_body(&body)?;
    let data = state.settings.set_restore_flags(request).await?;
    info!(
        restore_kill_switch = data.restore_kill_switch_on_boot,
        restore_tunnel = data.restore_tunnel_on_boot,
        "Updated boot restoration settings"
    );
    Ok(Json(data).into_response())
}

enum Lifecycle {
    Idle,
    Running { serve: JoinHandle<()> },
    Stopped,
}

/// The daemon's socket server and its start/stop lifecycle
pub struct DaemonServer {
    socket_path: PathBuf,
    poll_policy: RetryPolicy,
    grace: Duration,
    state: AppState,
    lifecycle: Mutex<Lifecycle>,
    stopped: CancellationToken,
}

impl DaemonServer {
    pub fn new(
        config: &DaemonConfig,
        backend: Arc<TunnelBackend>,
        settings: Arc<DaemonSettingsCache>,
        secrets: Arc<dyn SecretStore>,
        listener: Arc<dyn TunnelStateListener>,
    ) -> Self {
        Self {
            socket_path: config.socket_path.clone(),
            poll_policy: RetryPolicy::from_config(config),
            grace: config.shutdown_grace(),
            state: AppState {
                backend,
                settings,
                authenticator: RequestAuthenticator::new(secrets),
                listener,
                shutdown: CancellationToken::new(),
            },
            lifecycle: Mutex::new(Lifecycle::Idle),
            stopped: CancellationToken::new(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn backend(&self) -> &Arc<TunnelBackend> {
        &self.state.backend
    }

    /// Router with the interceptor installed, not bound to any socket
    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Bind the socket and start serving. Calling it again while running
    /// has no effect.
    pub async fn start(&self) -> Result<(), ServerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Running { .. } => {
                debug!("Daemon server already running");
                return Ok(());
            }
            Lifecycle::Stopped => return Err(ServerError::Stopped),
            Lifecycle::Idle => {}
        }

        let socket_error = |source: io::Error| ServerError::Socket {
            path: self.socket_path.clone(),
            source,
        };
        SocketProvisioner::prepare_directory(&self.socket_path).map_err(socket_error)?;
        SocketProvisioner::remove_stale(&self.socket_path).map_err(socket_error)?;
        let listener = UnixListener::bind(&self.socket_path).map_err(socket_error)?;
        info!(path = %self.socket_path.display(), "Daemon listening");

        let path = self.socket_path.clone();
        let policy = self.poll_policy;
        tokio::spawn(async move {
            SocketProvisioner::poll_until_ready(&path, policy).await;
        });

        self.restore_boot_state().await;

        let app = self.router();
        let shutdown = self.state.shutdown.clone();
        let serve = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                error!("Daemon server error: {e}");
            }
        });

        *lifecycle = Lifecycle::Running { serve };
        Ok(())
    }

    /// Tear down every tunnel, stop serving, remove the socket and release
    /// [`DaemonServer::wait`]. Later calls do nothing.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let serve = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Stopped => return,
            Lifecycle::Idle => None,
            Lifecycle::Running { serve } => Some(serve),
        };

        info!("Daemon stopping");
        self.state.backend.shutdown().await;
        self.state.shutdown.cancel();

        if let Some(mut serve) = serve {
            if tokio::time::timeout(self.grace, &mut serve).await.is_err() {
                warn!(
                    grace_secs = self.grace.as_secs(),
                    "Connections still open after grace period, aborting"
                );
                serve.abort();
            }
            if let Err(e) = SocketProvisioner::remove_stale(&self.socket_path) {
                warn!(path = %self.socket_path.display(), "Failed to remove socket: {e}");
            }
        }

        self.stopped.cancel();
        info!("Daemon stopped");
    }

    /// Resolve once [`DaemonServer::stop`] has completed
    pub async fn wait(&self) {
        self.stopped.cancelled().await;
    }

    async fn restore_boot_state(&self) {
        let data = match self.state.settings.load().await {
            Ok(data) => data,
            Err(e) => {
                warn!("Could not read settings, skipping boot restoration: {e}");
                return;
            }
        };

        if data.restore_kill_switch_on_boot && data.kill_switch.enabled {
            match self.state.backend.set_kill_switch(data.kill_switch).await {
                Ok(_) => info!("Restored kill switch from previous session"),
                Err(e) => warn!("Failed to restore kill switch: {e}"),
            }
        }

        if data.restore_tunnel_on_boot {
            if let Some(last) = data.last_active_tunnel {
                let id = last.tunnel.id;
                match self
                    .state
                    .backend
                    .start(last.tunnel, &last.quick_config, self.state.listener.clone())
                    .await
                {
                    Ok(_) => info!(tunnel_id = id, "Restored last active tunnel"),
                    Err(e) => warn!(tunnel_id = id, "Failed to restore last active tunnel: {e}"),
                }
            }
        }
    }
}
