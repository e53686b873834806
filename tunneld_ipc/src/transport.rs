//! IPC Transport Layer (client side)
//!
//! The daemon speaks HTTP/1.1 and WebSocket over its Unix Domain Socket.
//! [`DaemonClient`] opens one connection per request, signs it with the
//! caller's secret, and maps the daemon's status codes onto
//! [`DaemonError`]. [`DaemonApi`] is the seam the client-side services are
//! written against.

use crate::auth::{SecureCommand, SIGNATURE_HEADER, TIMESTAMP_HEADER, USER_HEADER};
use crate::messages::{
    BackendStatus, DaemonCacheData, DaemonHealth, ErrorBody, KillSwitchRequest,
    KillSwitchSettings, Mode, RestoreSettingsRequest, StartTunnelRequest, Tunnel, TunnelId,
};
use crate::secret::{current_username, SecretStore};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;

/// Result type for daemon calls
pub type DaemonResult<T> = Result<T, DaemonError>;

/// Error type for daemon calls
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DaemonError {
    /// The daemon could not be reached or the connection broke
    #[error("daemon unreachable: {0}")]
    Comms(String),

    /// The daemon rejected the request envelope
    #[error("request was not authorized by the daemon")]
    Unauthorized,

    /// The daemon could not parse the request
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The daemon was already in the requested state
    #[error("state conflict: {0}")]
    Conflict(String),

    /// The daemon or its engine failed to carry out the request
    #[error("daemon error: {0}")]
    Server(String),

    /// The daemon answered with something this client does not understand
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl DaemonError {
    /// Classify a non-success response
    pub fn from_status(status: u16, body: &[u8]) -> Self {
        let message = serde_json::from_slice::<ErrorBody>(body)
            .map(|b| b.error)
            .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned());
        match status {
            401 => DaemonError::Unauthorized,
            400 => DaemonError::BadRequest(message),
            409 => DaemonError::Conflict(message),
            500..=599 => DaemonError::Server(message),
            other => DaemonError::Protocol(format!("unexpected status {other}: {message}")),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, DaemonError::Conflict(_))
    }
}

/// Operations the daemon exposes to clients
#[async_trait]
pub trait DaemonApi: Send + Sync {
    /// `GET /daemon/status`
    async fn daemon_status(&self) -> DaemonResult<DaemonHealth>;

    /// `GET /backend/status`
    async fn backend_status(&self) -> DaemonResult<BackendStatus>;

    /// `WS /backend/status/ws`; the stream ends when the daemon closes it
    async fn subscribe_backend_status(
        &self,
    ) -> DaemonResult<BoxStream<'static, DaemonResult<BackendStatus>>>;

    /// `POST /tunnel/{id}/start`
    async fn start_tunnel(&self, tunnel: &Tunnel, quick_config: &str) -> DaemonResult<()>;

    /// `POST /tunnel/{id}/stop`
    async fn stop_tunnel(&self, id: TunnelId) -> DaemonResult<()>;

    /// `PUT /backend/mode`
    async fn set_mode(&self, mode: Mode) -> DaemonResult<()>;

    /// `PUT /backend/kill-switch`
    async fn set_kill_switch(&self, settings: KillSwitchSettings) -> DaemonResult<()>;

    /// `GET /daemon/settings`
    async fn settings(&self) -> DaemonResult<DaemonCacheData>;

    /// `PUT /daemon/settings`
    async fn update_settings(&self, update: RestoreSettingsRequest)
        -> DaemonResult<DaemonCacheData>;
}

/// Signed HTTP/WebSocket client for the daemon socket
#[derive(Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
    secret: Vec<u8>,
    user: String,
    request_timeout: Duration,
}

impl DaemonClient {
    pub fn new(socket_path: impl Into<PathBuf>, secret: Vec<u8>, user: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
            secret,
            user: user.into(),
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Client signing as the current user, provisioning their secret if needed
    pub fn for_current_user(
        socket_path: impl Into<PathBuf>,
        secrets: &dyn SecretStore,
    ) -> DaemonResult<Self> {
        let secret = secrets
            .get_or_create_local_secret()
            .map_err(|e| DaemonError::Comms(format!("failed to load IPC secret: {e}")))?;
        let user = current_username()
            .ok_or_else(|| DaemonError::Comms("could not determine current username".into()))?;
        Ok(Self::new(socket_path, secret, user))
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn connect(&self) -> DaemonResult<UnixStream> {
        UnixStream::connect(&self.socket_path).await.map_err(|e| {
            DaemonError::Comms(format!(
                "failed to connect to {}: {}",
                self.socket_path.display(),
                e
            ))
        })
    }

    /// Send one signed request and return the raw body of a 2xx response
    async fn request(&self, method: Method, path: &str, body: Option<String>) -> DaemonResult<Bytes> {
        let payload = body.unwrap_or_default();
        let command = SecureCommand::sign(&self.secret, &self.user, Some(payload.clone()));

        let request = Request::builder()
            .method(method.clone())
            .uri(path)
            .header(HOST, "localhost")
            .header(CONTENT_TYPE, "application/json")
            .header(TIMESTAMP_HEADER, command.timestamp.to_string())
            .header(SIGNATURE_HEADER, command.signature.as_str())
            .header(USER_HEADER, command.user_hint.as_str())
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| DaemonError::Protocol(format!("failed to build request: {e}")))?;

        let exchange = async {
            let stream = self.connect().await?;
            let (mut sender, connection) =
                hyper::client::conn::http1::handshake(TokioIo::new(stream))
                    .await
                    .map_err(|e| DaemonError::Comms(format!("HTTP handshake failed: {e}")))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    debug!("Daemon connection closed with error: {e}");
                }
            });

            let response = sender
                .send_request(request)
                .await
                .map_err(|e| DaemonError::Comms(format!("request failed: {e}")))?;
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| DaemonError::Comms(format!("failed to read response: {e}")))?
                .to_bytes();
            Ok::<_, DaemonError>((status, body))
        };

        let (status, body) = timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| DaemonError::Comms(format!("{method} {path} timed out")))??;

        debug!(%method, path, status = status.as_u16(), "Daemon responded");
        if status.is_success() {
            Ok(body)
        } else {
            Err(DaemonError::from_status(status.as_u16(), &body))
        }
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
    ) -> DaemonResult<T> {
        let bytes = self.request(method, path, body).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| DaemonError::Protocol(format!("invalid response to {path}: {e}")))
    }

    fn encode<T: serde::Serialize>(value: &T) -> DaemonResult<String> {
        serde_json::to_string(value)
            .map_err(|e| DaemonError::Protocol(format!("failed to encode request: {e}")))
    }

    /// Open a signed WebSocket on `path`
    async fn open_socket(
        &self,
        path: &str,
    ) -> DaemonResult<tokio_tungstenite::WebSocketStream<UnixStream>> {
        let command = SecureCommand::sign(&self.secret, &self.user, None);
        let mut request = format!("ws://localhost{path}")
            .into_client_request()
            .map_err(|e| DaemonError::Protocol(format!("invalid websocket request: {e}")))?;

        let header = |value: &str| {
            HeaderValue::from_str(value)
                .map_err(|e| DaemonError::Protocol(format!("invalid header value: {e}")))
        };
        let headers = request.headers_mut();
        headers.insert(TIMESTAMP_HEADER, header(&command.timestamp.to_string())?);
        headers.insert(SIGNATURE_HEADER, header(&command.signature)?);
        headers.insert(USER_HEADER, header(&command.user_hint)?);

        let stream = self.connect().await?;
        match tokio_tungstenite::client_async(request, stream).await {
            Ok((socket, _response)) => Ok(socket),
            Err(WsError::Http(response)) => {
                let body = response.body().clone().unwrap_or_default();
                Err(DaemonError::from_status(response.status().as_u16(), &body))
            }
            Err(e) => Err(DaemonError::Comms(format!("websocket handshake failed: {e}"))),
        }
    }

    /// Hold the daemon liveness stream open until the daemon closes it
    pub async fn wait_for_shutdown(&self) -> DaemonResult<()> {
        let mut socket = self.open_socket("/daemon/status/ws").await?;
        while let Some(message) = socket.next().await {
            match message {
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => return Err(DaemonError::Comms(e.to_string())),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DaemonApi for DaemonClient {
    async fn daemon_status(&self) -> DaemonResult<DaemonHealth> {
        self.request_json(Method::GET, "/daemon/status", None).await
    }

    async fn backend_status(&self) -> DaemonResult<BackendStatus> {
        self.request_json(Method::GET, "/backend/status", None).await
    }

    async fn subscribe_backend_status(
        &self,
    ) -> DaemonResult<BoxStream<'static, DaemonResult<BackendStatus>>> {
        let socket = self.open_socket("/backend/status/ws").await?;
        let updates = socket.filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => Some(
                    serde_json::from_str::<BackendStatus>(text.as_str())
                        .map_err(|e| DaemonError::Protocol(format!("invalid status update: {e}"))),
                ),
                Ok(_) => None,
                Err(e) => Some(Err(DaemonError::Comms(e.to_string()))),
            }
        });
        Ok(updates.boxed())
    }

    async fn start_tunnel(&self, tunnel: &Tunnel, quick_config: &str) -> DaemonResult<()> {
        let body = Self::encode(&StartTunnelRequest {
            name: tunnel.name.clone(),
            quick_config: quick_config.to_string(),
            features: tunnel.features.clone(),
        })?;
        self.request(Method::POST, &format!("/tunnel/{}/start", tunnel.id), Some(body))
            .await
            .map(|_| ())
    }

    async fn stop_tunnel(&self, id: TunnelId) -> DaemonResult<()> {
        self.request(Method::POST, &format!("/tunnel/{id}/stop"), None)
            .await
            .map(|_| ())
    }

    async fn set_mode(&self, mode: Mode) -> DaemonResult<()> {
        let body = Self::encode(&mode)?;
        self.request(Method::PUT, "/backend/mode", Some(body))
            .await
            .map(|_| ())
    }

    async fn set_kill_switch(&self, settings: KillSwitchSettings) -> DaemonResult<()> {
        let body = Self::encode(&KillSwitchRequest {
            enable: settings.enabled,
            bypass_lan: settings.bypass_lan,
        })?;
        self.request(Method::PUT, "/backend/kill-switch", Some(body))
            .await
            .map(|_| ())
    }

    async fn settings(&self) -> DaemonResult<DaemonCacheData> {
        self.request_json(Method::GET, "/daemon/settings", None).await
    }

    async fn update_settings(
        &self,
        update: RestoreSettingsRequest,
    ) -> DaemonResult<DaemonCacheData> {
        let body = Self::encode(&update)?;
        self.request_json(Method::PUT, "/daemon/settings", Some(body))
            .await
    }
}
