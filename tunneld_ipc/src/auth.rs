//! Request signing and verification.
//!
//! Every request to the daemon carries a [`SecureCommand`]: a timestamp, the
//! requesting username, and an HMAC-SHA256 over `timestamp || payload`
//! keyed with that user's secret. The daemon rejects envelopes whose
//! timestamp is more than [`REPLAY_WINDOW_SECS`] away from its own clock.

use crate::secret::SecretStore;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted distance between a request's timestamp and server time
pub const REPLAY_WINDOW_SECS: i64 = 30;

pub const TIMESTAMP_HEADER: &str = "x-tunneld-timestamp";
pub const SIGNATURE_HEADER: &str = "x-tunneld-signature";
pub const USER_HEADER: &str = "x-tunneld-user";

/// Current time in whole seconds since the Unix epoch
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Base64 HMAC-SHA256 over the decimal timestamp followed by the payload.
pub fn sign(secret: &[u8], timestamp: i64, payload: Option<&str>) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length
        Err(_) => return String::new(),
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(payload.unwrap_or_default().as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

/// Verify `signature` against the current clock.
pub fn verify(secret: &[u8], timestamp: i64, signature: &str, payload: Option<&str>) -> bool {
    verify_at(secret, timestamp, signature, payload, unix_now())
}

/// Verify `signature` as if the current time were `now`.
pub fn verify_at(
    secret: &[u8],
    timestamp: i64,
    signature: &str,
    payload: Option<&str>,
    now: i64,
) -> bool {
    if now.abs_diff(timestamp) > REPLAY_WINDOW_SECS as u64 {
        return false;
    }
    let Ok(provided) = STANDARD.decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(payload.unwrap_or_default().as_bytes());
    mac.verify_slice(&provided).is_ok()
}

/// Signed envelope carried by every authenticated request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureCommand {
    /// Signing time in seconds since the Unix epoch
    pub timestamp: i64,
    /// Base64 HMAC-SHA256 of `timestamp || payload`
    pub signature: String,
    /// Username whose secret verifies the signature
    pub user_hint: String,
    /// Request body exactly as sent
    pub payload: Option<String>,
}

impl SecureCommand {
    /// Sign `payload` for `user_hint` at the current time.
    pub fn sign(secret: &[u8], user_hint: &str, payload: Option<String>) -> Self {
        Self::sign_at(secret, user_hint, payload, unix_now())
    }

    pub fn sign_at(secret: &[u8], user_hint: &str, payload: Option<String>, timestamp: i64) -> Self {
        let signature = sign(secret, timestamp, payload.as_deref());
        Self {
            timestamp,
            signature,
            user_hint: user_hint.to_string(),
            payload,
        }
    }
}

/// Reasons a request failed authentication. Only logged; callers see 401
/// for everything except [`AuthError::Malformed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    Missing(&'static str),
    Malformed(String),
    UnknownUser,
    Expired,
    InvalidSignature,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Missing(field) => write!(f, "missing envelope field {field}"),
            AuthError::Malformed(msg) => write!(f, "malformed envelope: {msg}"),
            AuthError::UnknownUser => write!(f, "no secret for requesting user"),
            AuthError::Expired => write!(f, "timestamp outside replay window"),
            AuthError::InvalidSignature => write!(f, "invalid request signature"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Verifies [`SecureCommand`]s against per-user secrets
#[derive(Clone)]
pub struct RequestAuthenticator {
    secrets: Arc<dyn SecretStore>,
}

impl RequestAuthenticator {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self { secrets }
    }

    pub fn authenticate(&self, command: &SecureCommand) -> Result<(), AuthError> {
        self.authenticate_at(command, unix_now())
    }

    pub fn authenticate_at(&self, command: &SecureCommand, now: i64) -> Result<(), AuthError> {
        if now.abs_diff(command.timestamp) > REPLAY_WINDOW_SECS as u64 {
            return Err(AuthError::Expired);
        }
        let secret = self
            .secrets
            .resolve_secret_for_user(&command.user_hint)
            .ok_or(AuthError::UnknownUser)?;
        if verify_at(
            &secret,
            command.timestamp,
            &command.signature,
            command.payload.as_deref(),
            now,
        ) {
            Ok(())
        } else {
            Err(AuthError::InvalidSignature)
        }
    }
}
