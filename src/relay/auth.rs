// Bearer-credential resolution at handshake time.
//
// The relay only needs "token in, user id out"; issuing credentials is
// someone else's job. The production resolver checks an HS256-signed token
// and pulls the subject claim. Tests inject a static table instead.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::error::{RelayError, Result};
use super::stomp::Frame;

type HmacSha256 = Hmac<Sha256>;

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Resolve a bearer token to a user id, or reject it.
    async fn resolve(&self, token: &str) -> Result<String>;
}

/// Bearer token from a CONNECT frame's Authorization header, if any.
pub fn bearer_token(frame: &Frame) -> Option<&str> {
    let value = frame.header("authorization")?.trim();
    let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
    (!token.is_empty()).then_some(token)
}

// ---------------------------------------------------------------------------
// HS256 resolver
// ---------------------------------------------------------------------------

pub struct HmacIdentity {
    secret: Vec<u8>,
}

impl HmacIdentity {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn verify(&self, token: &str) -> Result<String> {
        let parts: Vec<&str> = token.splitn(3, '.').collect();
        if parts.len() != 3 {
            return Err(RelayError::Auth("malformed token".into()));
        }
        let (header_b64, payload_b64, sig_b64) = (parts[0], parts[1], parts[2]);

        let signature = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|e| RelayError::Auth(format!("bad signature encoding: {e}")))?;
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.secret)
            .expect("HMAC accepts any key length");
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(payload_b64.as_bytes());
        // Constant-time comparison via the hmac crate.
        mac.verify_slice(&signature)
            .map_err(|_| RelayError::Auth("invalid signature".into()))?;

        let header: serde_json::Value = decode_json_part(header_b64)?;
        match header.get("alg").and_then(|a| a.as_str()) {
            Some("HS256") => {}
            _ => return Err(RelayError::Auth("unsupported algorithm".into())),
        }

        let claims: serde_json::Value = decode_json_part(payload_b64)?;
        let now = chrono::Utc::now().timestamp();
        let exp = claims
            .get("exp")
            .and_then(|e| e.as_i64())
            .ok_or_else(|| RelayError::Auth("token has no expiration".into()))?;
        if now >= exp {
            return Err(RelayError::Auth("token expired".into()));
        }

        claims
            .get("sub")
            .and_then(|s| s.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| RelayError::Auth("token has no subject".into()))
    }
}

fn decode_json_part(part: &str) -> Result<serde_json::Value> {
    let bytes = URL_SAFE_NO_PAD
        .decode(part)
        .map_err(|e| RelayError::Auth(format!("bad token encoding: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| RelayError::Auth(format!("bad token json: {e}")))
}

/// Sign claims into an HS256 token. Test fixtures and operational tooling
/// mint tokens with this; the relay itself only verifies.
pub fn encode_token(claims: &serde_json::Value, secret: &[u8]) -> Result<String> {
    let header = serde_json::json!({"alg": "HS256", "typ": "JWT"});
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
    let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);

    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(header_b64.as_bytes());
    mac.update(b".");
    mac.update(payload_b64.as_bytes());
    let sig_b64 = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{header_b64}.{payload_b64}.{sig_b64}"))
}

#[async_trait]
impl IdentityResolver for HmacIdentity {
    async fn resolve(&self, token: &str) -> Result<String> {
        self.verify(token)
    }
}

// ---------------------------------------------------------------------------
// Static resolver
// ---------------------------------------------------------------------------

/// Fixed token table. Unknown tokens are rejected, so an empty table
/// doubles as a reject-everything resolver.
#[derive(Debug, Default)]
pub struct StaticIdentity {
    tokens: DashMap<String, String>,
}

impl StaticIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_token(&self, token: &str, user_id: &str) {
        self.tokens.insert(token.to_string(), user_id.to_string());
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentity {
    async fn resolve(&self, token: &str) -> Result<String> {
        self.tokens
            .get(token)
            .map(|user| user.clone())
            .ok_or_else(|| RelayError::Auth("unknown token".into()))
    }
}
