use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Normalized REST failure shape surfaced to the UI: a human-readable message
/// plus the HTTP status when one was received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct ApiError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ApiError {
    pub fn new(message: impl Into<String>, status: Option<u16>) -> Self {
        Self {
            message: message.into(),
            status,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(message, None)
    }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self::new(message, Some(status))
    }

    pub fn is_auth(&self) -> bool {
        self.status == Some(401)
    }
}
