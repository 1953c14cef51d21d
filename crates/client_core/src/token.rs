use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use shared::error::ApiError;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Credential collaborator consumed by the connection manager and the REST
/// client. The real application persists tokens elsewhere; this subsystem
/// only reads, refreshes, and clears them.
#[async_trait]
pub trait TokenStore: Send + Sync {
    fn access_token(&self) -> Option<String>;
    async fn refresh(&self) -> Result<(), ApiError>;
    fn clear(&self);
}

/// Process-local token holder for embedders and tests. It cannot mint new
/// tokens, so `refresh` always fails.
#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    tokens: Mutex<Option<TokenPair>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        let store = Self::new();
        store.set_tokens(TokenPair {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        });
        store
    }

    pub fn set_tokens(&self, pair: TokenPair) {
        *self.lock() = Some(pair);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<TokenPair>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    fn access_token(&self) -> Option<String> {
        self.lock().as_ref().map(|pair| pair.access_token.clone())
    }

    async fn refresh(&self) -> Result<(), ApiError> {
        Err(ApiError::network(
            "token refresh is not supported by the in-memory store",
        ))
    }

    fn clear(&self) {
        *self.lock() = None;
    }
}

/// Extracts the user identifier from a JWT access token by decoding the
/// payload segment. No signature validation happens here; the value is used
/// for identification only, never authorization.
pub fn user_id_from_token(token: &str) -> Option<String> {
    let payload = token.split('.').nth(1)?;
    let bytes = decode_base64_segment(payload)?;
    let claims: serde_json::Value = match serde_json::from_slice(&bytes) {
        Ok(claims) => claims,
        Err(err) => {
            warn!(error = %err, "access token payload is not valid JSON");
            return None;
        }
    };

    for key in ["id", "user_id", "sub"] {
        match claims.get(key) {
            Some(serde_json::Value::String(value)) if !value.is_empty() => {
                return Some(value.clone());
            }
            Some(serde_json::Value::Number(value)) => return Some(value.to_string()),
            _ => {}
        }
    }
    None
}

fn decode_base64_segment(segment: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .ok()
        .or_else(|| STANDARD.decode(segment).ok())
}
