//! Session tokens
//!
//! `sess-<payload>.<signature>`: the payload is URL-safe base64 JSON holding the
//! principal and its scopes, the signature is a truncated HMAC-SHA256 over the
//! encoded payload.

use crate::auth::principal::Principal;
use crate::auth::scopes::ScopeRestriction;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use thiserror::Error;

pub const SESSION_TOKEN_PREFIX: &str = "sess-";

const SIGNATURE_LEN: usize = 16;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token format")]
    InvalidFormat,

    #[error("invalid token prefix: expected '{expected}', got '{got}'")]
    InvalidPrefix { expected: String, got: String },

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("token decode error: {0}")]
    DecodeError(String),
}

/// What a session token asserts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPayload {
    pub principal: Principal,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// A signed, self-contained session token
#[derive(Debug, Clone)]
pub struct SessionToken {
    token: String,
    payload: SessionPayload,
}

fn sign(secret: &[u8], encoded_payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(encoded_payload.as_bytes());
    let signature = mac.finalize().into_bytes();
    URL_SAFE_NO_PAD.encode(&signature[..SIGNATURE_LEN])
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

impl SessionToken {
    /// Mint a token for a principal with the given scopes
    pub fn create(principal: Principal, scopes: Vec<String>, secret: &[u8]) -> Result<Self, TokenError> {
        let payload = SessionPayload { principal, scopes };
        let payload_json =
            serde_json::to_vec(&payload).map_err(|e| TokenError::DecodeError(e.to_string()))?;
        let payload_b64 = URL_SAFE_NO_PAD.encode(&payload_json);
        let signature_b64 = sign(secret, &payload_b64);

        let token = format!("{}{}.{}", SESSION_TOKEN_PREFIX, payload_b64, signature_b64);
        Ok(Self { token, payload })
    }

    /// Parse and verify a session token
    pub fn parse(token: &str, secret: &[u8]) -> Result<Self, TokenError> {
        let content = token.strip_prefix(SESSION_TOKEN_PREFIX).ok_or_else(|| TokenError::InvalidPrefix {
            expected: SESSION_TOKEN_PREFIX.to_string(),
            got: token.chars().take(SESSION_TOKEN_PREFIX.len()).collect(),
        })?;

        let (payload_b64, signature_b64) = content.split_once('.').ok_or(TokenError::InvalidFormat)?;
        if signature_b64.contains('.') {
            return Err(TokenError::InvalidFormat);
        }

        if !constant_time_eq(signature_b64, &sign(secret, payload_b64)) {
            return Err(TokenError::InvalidSignature);
        }

        let payload_json = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|e| TokenError::DecodeError(e.to_string()))?;
        let payload: SessionPayload =
            serde_json::from_slice(&payload_json).map_err(|e| TokenError::DecodeError(e.to_string()))?;

        Ok(Self {
            token: token.to_string(),
            payload,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.token
    }

    pub fn principal(&self) -> &Principal {
        &self.payload.principal
    }

    pub fn scopes(&self) -> &[String] {
        &self.payload.scopes
    }

    /// The scope restriction this session is bound to
    pub fn restriction(&self) -> ScopeRestriction {
        ScopeRestriction::from_scopes(&self.payload.scopes)
    }

    pub fn into_payload(self) -> SessionPayload {
        self.payload
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token)
    }
}
