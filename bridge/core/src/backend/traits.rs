//! Backend Adapter Traits
//!
//! Trait definitions for LLM backends. The dispatcher only talks to
//! [`BackendAdapter`], so a new provider is added by implementing the trait
//! rather than by copying the dispatch path.
//!
//! # Fragment streams
//!
//! A streaming reply is a [`FragmentStream`]: a finite, non-restartable
//! sequence of text deltas that ends with exactly one terminal item, either
//! [`Fragment::Done`] or [`Fragment::Failed`]. The stream owns the task that
//! reads the HTTP body; dropping the stream aborts that task, which releases
//! the connection on every exit path.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::conversation::Turn;
use crate::error::{BridgeError, Result};

/// Channel capacity between a reader task and its [`FragmentStream`]
pub const FRAGMENT_CHANNEL_CAPACITY: usize = 100;

/// Request timeout applied to backend HTTP clients
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// One item of a streaming reply
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fragment {
    /// A piece of generated text
    Delta(String),
    /// The backend finished the answer
    Done,
    /// The stream broke off
    Failed(BridgeError),
}

impl Fragment {
    /// Whether this item ends the stream
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }
}

/// Sending half used by reader tasks
pub type FragmentSender = mpsc::Sender<Fragment>;

/// Lazily produced reply fragments from a backend
pub struct FragmentStream {
    receiver: mpsc::Receiver<Fragment>,
    reader: Option<JoinHandle<()>>,
    finished: bool,
}

impl FragmentStream {
    /// Wrap a receiver fed by some producer
    #[must_use]
    pub fn new(receiver: mpsc::Receiver<Fragment>) -> Self {
        Self {
            receiver,
            reader: None,
            finished: false,
        }
    }

    /// Create a channel and a stream reading from it
    #[must_use]
    pub fn channel() -> (FragmentSender, Self) {
        let (tx, rx) = mpsc::channel(FRAGMENT_CHANNEL_CAPACITY);
        (tx, Self::new(rx))
    }

    /// Tie the producing task to this stream so it is aborted on drop
    #[must_use]
    pub fn with_reader(mut self, reader: JoinHandle<()>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// A stream that yields one complete text and finishes
    #[must_use]
    pub fn once(text: impl Into<String>) -> Self {
        Self::from_fragments(vec![Fragment::Delta(text.into()), Fragment::Done])
    }

    /// A stream over a fixed list of items
    #[must_use]
    pub fn from_fragments(fragments: Vec<Fragment>) -> Self {
        let (tx, rx) = mpsc::channel(fragments.len().max(1));
        for fragment in fragments {
            // Capacity matches the item count, so this never fails
            let _ = tx.try_send(fragment);
        }
        Self::new(rx)
    }

    /// Receive the next item
    ///
    /// Returns `None` once a terminal item has been delivered. A producer that
    /// disappears without a terminal item yields one [`Fragment::Failed`].
    pub async fn next(&mut self) -> Option<Fragment> {
        if self.finished {
            return None;
        }

        let fragment = match self.receiver.recv().await {
            Some(fragment) => fragment,
            None => Fragment::Failed(BridgeError::Stream(
                "stream disconnected unexpectedly".to_string(),
            )),
        };

        if fragment.is_terminal() {
            self.close();
        }
        Some(fragment)
    }

    /// Whether the stream has delivered its terminal item or was closed
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Stop the producer and release its resources
    pub fn close(&mut self) {
        self.finished = true;
        self.receiver.close();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for FragmentStream {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl std::fmt::Debug for FragmentStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentStream")
            .field("finished", &self.finished)
            .field("has_reader", &self.reader.is_some())
            .finish()
    }
}

/// LLM backend adapter
///
/// Implement this trait to add support for a new provider.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Backend name for logs (e.g. "chat-completion")
    fn name(&self) -> &str;

    /// Whether [`BackendAdapter::send_streaming`] delivers incremental deltas
    fn supports_streaming(&self) -> bool;

    /// Send the history and wait for the complete answer
    async fn send_once(&self, history: &[Turn]) -> Result<String>;

    /// Send the history and receive the answer as fragments
    ///
    /// Backends without native streaming deliver their single reply as one
    /// fragment.
    async fn send_streaming(&self, history: &[Turn]) -> Result<FragmentStream> {
        let text = self.send_once(history).await?;
        Ok(FragmentStream::once(text))
    }
}

/// Backend connection configuration
///
/// Deserializes from a `[backends.<name>]` table tagged with `kind`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// OpenAI-compatible chat completion API
    ChatCompletion {
        /// API base URL, without the `/chat/completions` suffix
        #[serde(default = "default_chat_base_url")]
        base_url: String,
        /// Bearer token
        #[serde(default)]
        api_key: String,
        /// Model identifier
        #[serde(default = "default_chat_model")]
        model: String,
        /// Maximum tokens per answer
        #[serde(default = "default_max_tokens")]
        max_tokens: u32,
    },
    /// PaLM `generateMessage` API
    GenerateMessage {
        /// API base URL, without the `/models/...` suffix
        #[serde(default = "default_palm_base_url")]
        base_url: String,
        /// API key passed as the `key` query parameter
        #[serde(default)]
        api_key: String,
        /// Model identifier
        #[serde(default = "default_palm_model")]
        model: String,
        /// Sampling temperature
        #[serde(default = "default_temperature")]
        temperature: f32,
    },
}

fn default_chat_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_chat_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_max_tokens() -> u32 {
    512
}

fn default_palm_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta2".to_string()
}

fn default_palm_model() -> String {
    "chat-bison-001".to_string()
}

fn default_temperature() -> f32 {
    0.75
}

impl BackendConfig {
    /// Chat completion configuration with default endpoint and model
    pub fn chat_completion(api_key: impl Into<String>) -> Self {
        Self::ChatCompletion {
            base_url: default_chat_base_url(),
            api_key: api_key.into(),
            model: default_chat_model(),
            max_tokens: default_max_tokens(),
        }
    }

    /// Generate message configuration with default endpoint and model
    pub fn generate_message(api_key: impl Into<String>) -> Self {
        Self::GenerateMessage {
            base_url: default_palm_base_url(),
            api_key: api_key.into(),
            model: default_palm_model(),
            temperature: default_temperature(),
        }
    }

    /// Replace the base URL
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        match &mut self {
            Self::ChatCompletion { base_url, .. } | Self::GenerateMessage { base_url, .. } => {
                *base_url = url.into();
            }
        }
        self
    }

    /// Replace the API key
    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        match &mut self {
            Self::ChatCompletion { api_key, .. } | Self::GenerateMessage { api_key, .. } => {
                *api_key = key.into();
            }
        }
        self
    }

    /// Configured API key
    #[must_use]
    pub fn api_key(&self) -> &str {
        match self {
            Self::ChatCompletion { api_key, .. } | Self::GenerateMessage { api_key, .. } => {
                api_key
            }
        }
    }

    /// Configured base URL
    #[must_use]
    pub fn base_url(&self) -> &str {
        match self {
            Self::ChatCompletion { base_url, .. } | Self::GenerateMessage { base_url, .. } => {
                base_url
            }
        }
    }
}
