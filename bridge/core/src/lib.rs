//! Bridge Core - Chat-to-LLM Relay Logic for llm-bridge
//!
//! This crate holds everything between a chat event and the answer that
//! appears in the channel, independent of how events reach the process.
//!
//! # Architecture
//!
//! ```text
//! InboundEvent
//!      │
//!      ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Dispatcher                                                   │
//! │   route by channel ──▶ ConversationStore.lock(channel)       │
//! │                         append(user) ─▶ bounded history      │
//! │                                │                             │
//! │                                ▼                             │
//! │                        BackendAdapter                        │
//! │           ChatCompletion (SSE)  │  GenerateMessage (single)  │
//! │                                ▼                             │
//! │   StreamAggregator ──▶ MessagePublisher ──▶ ChatPlatform     │
//! │                                │                             │
//! │                        append(assistant)                     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: LLM backend abstraction (chat completion, generate message)
//! - [`chat`]: Outbound chat operations and the Discord REST client
//! - [`config`]: TOML / environment configuration
//! - [`conversation`]: Per-channel sliding-window histories
//! - [`dispatcher`]: Inbound event routing and round trips
//! - [`error`]: Error taxonomy shared by every component
//! - [`streaming`]: Fragment aggregation and throttled publishing

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod chat;
pub mod config;
pub mod conversation;
pub mod dispatcher;
pub mod error;
pub mod streaming;

// Re-exports for convenience
pub use backend::{
    build_backend, BackendAdapter, BackendConfig, ChatCompletionBackend, Fragment,
    FragmentStream, GenerateMessageBackend,
};
pub use chat::{ChatPlatform, DiscordRest, MessagePublisher};
pub use conversation::{ConversationGuard, ConversationStore, Role, Turn};
pub use dispatcher::{DispatchOutcome, Dispatcher, FailureSite, InboundEvent, Route};
pub use error::{BridgeError, Result};
pub use streaming::{PublishPolicy, Publisher, StreamAggregator, StreamOutcome};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, BridgeConfig, ChannelRoute,
    ConfigError, ConfigOverrides, ConfigSource,
};
