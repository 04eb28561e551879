//! Error Taxonomy
//!
//! Every failure the bridge can hit while serving a chat event falls into one
//! of four kinds. Adapters, the aggregator and the chat client all return
//! [`BridgeError`]; the dispatcher maps the failure site to a fixed notice.

use thiserror::Error;

/// Errors raised while turning a chat event into a published answer
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BridgeError {
    /// Network or HTTP-level failure talking to a backend or the chat platform
    #[error("transport error: {0}")]
    Transport(String),

    /// Backend answered, but with an error payload or without the expected fields
    #[error("backend error: {0}")]
    Backend(String),

    /// A fragment stream failed after it had started
    #[error("stream error: {0}")]
    Stream(String),

    /// Sending or editing a chat message failed
    #[error("publish error: {0}")]
    Publish(String),
}

impl BridgeError {
    /// Short label for structured logging
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Backend(_) => "backend",
            Self::Stream(_) => "stream",
            Self::Publish(_) => "publish",
        }
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Backend(format!("undecodable response body: {err}"))
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, BridgeError>;
