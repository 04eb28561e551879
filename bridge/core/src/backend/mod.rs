//! LLM Backend Integration
//!
//! Adapters translating a conversation history into provider requests and
//! normalizing the replies.
//!
//! # Available Backends
//!
//! - **ChatCompletion**: OpenAI-compatible `/chat/completions`, streamed over SSE
//! - **GenerateMessage**: PaLM `generateMessage`, one candidate per call
//!
//! # Usage
//!
//! ```ignore
//! use bridge_core::backend::{build_backend, BackendConfig};
//!
//! let backend = build_backend(&BackendConfig::chat_completion("sk-..."))?;
//! let mut stream = backend.send_streaming(&history).await?;
//! ```

mod chat_completion;
mod generate_message;
mod traits;

use std::sync::Arc;

use serde::Deserialize;

use crate::error::{BridgeError, Result};

pub use chat_completion::ChatCompletionBackend;
pub use generate_message::GenerateMessageBackend;
pub use traits::{
    BackendAdapter, BackendConfig, Fragment, FragmentSender, FragmentStream,
    FRAGMENT_CHANNEL_CAPACITY,
};

/// Build the adapter described by a backend configuration
///
/// # Errors
///
/// Returns [`BridgeError::Transport`] if the HTTP client cannot be created.
pub fn build_backend(config: &BackendConfig) -> Result<Arc<dyn BackendAdapter>> {
    let backend: Arc<dyn BackendAdapter> = match config {
        BackendConfig::ChatCompletion { .. } => Arc::new(ChatCompletionBackend::from_config(config)?),
        BackendConfig::GenerateMessage { .. } => {
            Arc::new(GenerateMessageBackend::from_config(config)?)
        }
    };
    Ok(backend)
}

/// Error body shape shared by both providers: `{"error": {"message": ...}}`
#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Extract a provider error message from a JSON body, if it carries one
pub(crate) fn error_payload(body: &str) -> Option<String> {
    serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .map(|envelope| envelope.error.message)
}

/// Classify a non-success HTTP response
///
/// A body with a provider error payload is a backend error; anything else is
/// treated as a transport failure.
pub(crate) fn status_error(status: reqwest::StatusCode, body: &str) -> BridgeError {
    match error_payload(body) {
        Some(message) => BridgeError::Backend(format!("{status}: {message}")),
        None => BridgeError::Transport(format!("{status}: {body}")),
    }
}
