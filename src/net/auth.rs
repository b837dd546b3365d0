//! Connection authentication. The web client obtains a short-lived token
//! from the account service and presents it as `?token=` when it opens the
//! game socket; the token alone decides which character the socket plays.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64_ENGINE;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::session::Identity;

type HmacSha256 = Hmac<Sha256>;

pub const LEGACY_TOKEN_LIFETIME: Duration = Duration::from_millis(3000);

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake rejected: {0}")]
    Rejected(String),
    #[error("malformed handshake: {0}")]
    Malformed(String),
    #[error("handshake i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolves the opaque token of an incoming connection to the character it
/// may play.
pub trait HandshakeAuthenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<Identity, HandshakeError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenPayload {
    name: String,
    expire: i64,
    token: String,
}

/// Base64 JSON tokens signed with HMAC-SHA256 over `name + expire`, the
/// format the legacy login service hands out.
pub struct LegacyTokenService {
    secret: Vec<u8>,
    lifetime: Duration,
}

impl LegacyTokenService {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            lifetime: LEGACY_TOKEN_LIFETIME,
        }
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn issue(&self, name: &str) -> Result<String, HandshakeError> {
        self.issue_at(name, unix_millis())
    }

    pub fn issue_at(&self, name: &str, now_ms: i64) -> Result<String, HandshakeError> {
        let expire = now_ms.saturating_add(self.lifetime.as_millis() as i64);
        let payload = TokenPayload {
            name: name.to_string(),
            expire,
            token: hex::encode(self.signature(name, expire)?),
        };
        let json = serde_json::to_vec(&payload)
            .map_err(|err| HandshakeError::Malformed(format!("token encode failed: {err}")))?;
        Ok(BASE64_ENGINE.encode(json))
    }

    pub fn validate_at(&self, token: &str, now_ms: i64) -> Result<Identity, HandshakeError> {
        let normalized = normalize_token(token)
            .ok_or_else(|| HandshakeError::Rejected("missing token".to_string()))?;
        let json = BASE64_ENGINE
            .decode(normalized.as_bytes())
            .map_err(|_| HandshakeError::Rejected("token is not base64".to_string()))?;
        let payload: TokenPayload = serde_json::from_slice(&json)
            .map_err(|_| HandshakeError::Rejected("token payload unreadable".to_string()))?;

        let name = payload.name.trim();
        if name.is_empty() {
            return Err(HandshakeError::Rejected("token has no name".to_string()));
        }
        if payload.token.trim().is_empty() {
            return Err(HandshakeError::Rejected("token has no signature".to_string()));
        }
        if payload.expire <= now_ms {
            return Err(HandshakeError::Rejected(format!("token for {name} expired")));
        }

        let signature = hex::decode(payload.token.trim())
            .map_err(|_| HandshakeError::Rejected("signature is not hex".to_string()))?;
        let mut mac = self.mac()?;
        mac.update(payload.name.as_bytes());
        mac.update(payload.expire.to_string().as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| HandshakeError::Rejected(format!("bad signature for {name}")))?;

        Ok(Identity::new(payload.name))
    }

    fn mac(&self) -> Result<HmacSha256, HandshakeError> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|err| HandshakeError::Malformed(format!("hmac key rejected: {err}")))
    }

    fn signature(&self, name: &str, expire: i64) -> Result<Vec<u8>, HandshakeError> {
        let mut mac = self.mac()?;
        mac.update(name.as_bytes());
        mac.update(expire.to_string().as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

impl HandshakeAuthenticator for LegacyTokenService {
    fn authenticate(&self, token: &str) -> Result<Identity, HandshakeError> {
        self.validate_at(token, unix_millis())
    }
}

/// Undoes the damage query strings do to base64: percent escapes, `+`
/// turned into spaces, and stripped padding.
fn normalize_token(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut token = percent_decode(trimmed).replace(' ', "+");
    let missing = token.len() % 4;
    if missing != 0 {
        token.extend(std::iter::repeat('=').take(4 - missing));
    }
    Some(token)
}

pub(crate) fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'%' && idx + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[idx + 1]), hex_value(bytes[idx + 2])) {
                out.push(hi << 4 | lo);
                idx += 3;
                continue;
            }
        }
        out.push(bytes[idx]);
        idx += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
