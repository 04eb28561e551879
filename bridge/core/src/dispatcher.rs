//! Inbound Event Dispatch
//!
//! The [`Dispatcher`] turns one chat event into one backend round trip:
//!
//! 1. Events from the bot itself or from unrouted channels are ignored.
//! 2. `ping` / `Ping` is answered with `Pong!`.
//! 3. Streaming backends get a placeholder message that is edited in place as
//!    fragments arrive; the assistant turn is committed once the final edit
//!    succeeds.
//! 4. Non-streaming backends answer with a single message.
//! 5. One-shot routes send `[seed, user]` and leave the store untouched.
//!
//! The per-conversation lock is held for the whole round trip, so turns of one
//! channel commit in the order their events were processed.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::backend::{build_backend, BackendAdapter};
use crate::chat::{ChatPlatform, MessagePublisher, DEFAULT_TYPING_INDICATOR};
use crate::config::BridgeConfig;
use crate::conversation::{ConversationGuard, ConversationStore, Role, Turn};
use crate::error::{BridgeError, Result};
use crate::streaming::{PublishPolicy, StreamAggregator, StreamOutcome};

/// Reply to a ping
pub const PONG: &str = "Pong!";

// ============================================================================
// Events and Routes
// ============================================================================

/// A message observed on the chat platform
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Platform message id
    pub event_id: String,
    /// Author of the message
    pub author_id: String,
    /// Channel the message was posted in; doubles as conversation id
    pub channel_id: String,
    /// Message content
    pub text: String,
}

impl InboundEvent {
    /// Convenience constructor
    pub fn new(
        event_id: impl Into<String>,
        author_id: impl Into<String>,
        channel_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            author_id: author_id.into(),
            channel_id: channel_id.into(),
            text: text.into(),
        }
    }

    fn is_ping(&self) -> bool {
        self.text == "ping" || self.text == "Ping"
    }
}

/// Backend and history mode serving one channel
#[derive(Clone)]
pub struct Route {
    /// Backend answering this channel
    pub backend: Arc<dyn BackendAdapter>,
    /// Keep a rolling history (false = one-shot)
    pub session: bool,
}

impl Route {
    /// Route with conversation history
    pub fn session(backend: Arc<dyn BackendAdapter>) -> Self {
        Self {
            backend,
            session: true,
        }
    }

    /// Route without conversation history
    pub fn one_shot(backend: Arc<dyn BackendAdapter>) -> Self {
        Self {
            backend,
            session: false,
        }
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("backend", &self.backend.name())
            .field("session", &self.session)
            .finish()
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Where a round trip failed; each site has a fixed user-facing notice
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureSite {
    /// Chat completion request rejected or unreachable
    CompletionRequest,
    /// Stream broke after it started
    Stream,
    /// Generate message request failed
    MessageGeneration,
    /// Placeholder, reply or final edit could not be delivered
    Edit,
}

impl FailureSite {
    /// Notice posted to the channel
    #[must_use]
    pub fn notice(&self) -> &'static str {
        match self {
            Self::CompletionRequest => {
                "Something went wrong with the chat completion. Please try again later."
            }
            Self::Stream => "Something went wrong with Stream. Please try again later.",
            Self::MessageGeneration => {
                "Something went wrong with the message generation. Please try again later."
            }
            Self::Edit => "Something went wrong with Edit. Please try again later.",
        }
    }

    /// Site of a failed request to `backend`
    fn request(backend: &dyn BackendAdapter) -> Self {
        if backend.supports_streaming() {
            Self::CompletionRequest
        } else {
            Self::MessageGeneration
        }
    }
}

/// Why an event was not handled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Written by the bot itself
    OwnMessage,
    /// Channel has no route
    UnroutedChannel,
}

/// Result of dispatching one event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Nothing was done
    Ignored(IgnoreReason),
    /// Answered a ping
    Pong,
    /// The answer was delivered
    Replied {
        /// Complete answer
        text: String,
    },
    /// The round trip failed and a notice was posted
    Failed {
        /// Failure site
        site: FailureSite,
        /// Underlying error
        error: BridgeError,
    },
    /// Shutdown interrupted the round trip
    Cancelled,
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Routes inbound events to backends and publishes their answers
pub struct Dispatcher {
    store: Arc<ConversationStore>,
    chat: Arc<dyn ChatPlatform>,
    routes: HashMap<String, Route>,
    bot_user_id: String,
    policy: PublishPolicy,
    typing_indicator: String,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// Create a dispatcher with no routes
    pub fn new(store: Arc<ConversationStore>, chat: Arc<dyn ChatPlatform>) -> Self {
        Self {
            store,
            chat,
            routes: HashMap::new(),
            bot_user_id: String::new(),
            policy: PublishPolicy::default(),
            typing_indicator: DEFAULT_TYPING_INDICATOR.to_string(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Build the store, backends and routes described by `config`
    ///
    /// Channels naming the same backend share one adapter instance.
    ///
    /// # Errors
    ///
    /// Fails if a backend cannot be constructed or a channel names an
    /// unknown backend.
    pub fn from_config(config: &BridgeConfig, chat: Arc<dyn ChatPlatform>) -> Result<Self> {
        let store = Arc::new(ConversationStore::new(
            config.seed_prompt.clone(),
            config.window_size,
        ));

        let mut backends: HashMap<&str, Arc<dyn BackendAdapter>> = HashMap::new();
        for (name, backend_config) in &config.backends {
            backends.insert(name.as_str(), build_backend(backend_config)?);
        }

        let mut dispatcher = Self::new(store, chat)
            .with_bot_user_id(config.chat.bot_user_id.clone())
            .with_publish_policy(PublishPolicy::every(config.publish_every))
            .with_typing_indicator(config.typing_indicator.clone());

        for channel in &config.channels {
            let backend = backends.get(channel.backend.as_str()).cloned().ok_or_else(|| {
                BridgeError::Backend(format!("unknown backend '{}'", channel.backend))
            })?;
            let route = if channel.session {
                Route::session(backend)
            } else {
                Route::one_shot(backend)
            };
            tracing::info!(
                channel_id = %channel.id,
                backend = %channel.backend,
                session = channel.session,
                "Registered channel route"
            );
            dispatcher = dispatcher.with_route(channel.id.clone(), route);
        }

        Ok(dispatcher)
    }

    /// Serve `channel_id` with `route`
    #[must_use]
    pub fn with_route(mut self, channel_id: impl Into<String>, route: Route) -> Self {
        self.routes.insert(channel_id.into(), route);
        self
    }

    /// Ignore events authored by this id
    #[must_use]
    pub fn with_bot_user_id(mut self, id: impl Into<String>) -> Self {
        self.bot_user_id = id.into();
        self
    }

    /// Set the partial publish interval
    #[must_use]
    pub fn with_publish_policy(mut self, policy: PublishPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the placeholder / typing indicator text
    #[must_use]
    pub fn with_typing_indicator(mut self, indicator: impl Into<String>) -> Self {
        self.typing_indicator = indicator.into();
        self
    }

    /// Use an externally owned shutdown token
    #[must_use]
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// The conversation store
    #[must_use]
    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Token that cancels in-flight round trips
    #[must_use]
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Number of routed channels
    #[must_use]
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Handle one inbound event
    pub async fn dispatch(&self, event: InboundEvent) -> DispatchOutcome {
        if !self.bot_user_id.is_empty() && event.author_id == self.bot_user_id {
            return DispatchOutcome::Ignored(IgnoreReason::OwnMessage);
        }
        let Some(route) = self.routes.get(&event.channel_id) else {
            tracing::trace!(channel_id = %event.channel_id, "Ignoring unrouted channel");
            return DispatchOutcome::Ignored(IgnoreReason::UnroutedChannel);
        };

        tracing::info!(
            event_id = %event.event_id,
            author_id = %event.author_id,
            channel_id = %event.channel_id,
            backend = route.backend.name(),
            "Message received"
        );

        if event.is_ping() {
            return match self.chat.send_message(&event.channel_id, PONG).await {
                Ok(_) => DispatchOutcome::Pong,
                Err(e) => {
                    tracing::warn!(channel_id = %event.channel_id, error = %e, "Pong failed");
                    DispatchOutcome::Failed {
                        site: FailureSite::Edit,
                        error: e,
                    }
                }
            };
        }

        if !route.session {
            self.dispatch_one_shot(&event, route.backend.as_ref()).await
        } else if route.backend.supports_streaming() {
            self.dispatch_streaming(&event, route.backend.as_ref()).await
        } else {
            self.dispatch_single(&event, route.backend.as_ref()).await
        }
    }

    /// Streaming round trip: placeholder, throttled edits, commit
    async fn dispatch_streaming(
        &self,
        event: &InboundEvent,
        backend: &dyn BackendAdapter,
    ) -> DispatchOutcome {
        let channel_id = event.channel_id.as_str();
        let Some(mut conversation) = self.lock_conversation(channel_id).await else {
            return DispatchOutcome::Cancelled;
        };
        let history = conversation.append(Role::User, event.text.as_str());

        let placeholder = if self.typing_indicator.is_empty() {
            DEFAULT_TYPING_INDICATOR
        } else {
            self.typing_indicator.as_str()
        };
        let message_id = match self.chat.send_message(channel_id, placeholder).await {
            Ok(id) => id,
            Err(e) => return self.report(channel_id, FailureSite::Edit, e).await,
        };

        let stream = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => return DispatchOutcome::Cancelled,
            stream = backend.send_streaming(&history) => stream,
        };
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => return self.report(channel_id, FailureSite::request(backend), e).await,
        };

        let publisher = MessagePublisher::new(
            self.chat.as_ref(),
            channel_id,
            &message_id,
            &self.typing_indicator,
        );
        let mut aggregator = StreamAggregator::new(self.policy);

        match aggregator.run(stream, &publisher, &self.shutdown).await {
            StreamOutcome::Completed { text, .. } => {
                conversation.append(Role::Assistant, text.as_str());
                DispatchOutcome::Replied { text }
            }
            StreamOutcome::Failed { error, partial } => {
                tracing::debug!(
                    channel_id,
                    partial_len = partial.len(),
                    "Discarding partial answer"
                );
                let site = if matches!(error, BridgeError::Publish(_)) {
                    FailureSite::Edit
                } else {
                    FailureSite::Stream
                };
                self.report(channel_id, site, error).await
            }
            StreamOutcome::Cancelled { .. } => DispatchOutcome::Cancelled,
        }
    }

    /// Non-streaming round trip with history
    async fn dispatch_single(
        &self,
        event: &InboundEvent,
        backend: &dyn BackendAdapter,
    ) -> DispatchOutcome {
        let channel_id = event.channel_id.as_str();
        let Some(mut conversation) = self.lock_conversation(channel_id).await else {
            return DispatchOutcome::Cancelled;
        };
        let history = conversation.append(Role::User, event.text.as_str());

        let reply = match self.request_once(backend, &history).await {
            Some(Ok(reply)) => reply,
            Some(Err(e)) => return self.report(channel_id, FailureSite::request(backend), e).await,
            None => return DispatchOutcome::Cancelled,
        };
        conversation.append(Role::Assistant, reply.as_str());
        drop(conversation);

        self.deliver(channel_id, reply).await
    }

    /// Round trip against `[seed, user]`; the store is not touched
    async fn dispatch_one_shot(
        &self,
        event: &InboundEvent,
        backend: &dyn BackendAdapter,
    ) -> DispatchOutcome {
        let channel_id = event.channel_id.as_str();
        let history = [
            Turn::new(Role::System, self.store.seed()),
            Turn::new(Role::User, event.text.as_str()),
        ];

        match self.request_once(backend, &history).await {
            Some(Ok(reply)) => self.deliver(channel_id, reply).await,
            Some(Err(e)) => self.report(channel_id, FailureSite::request(backend), e).await,
            None => DispatchOutcome::Cancelled,
        }
    }

    /// Lock a conversation unless shutdown fires first
    ///
    /// Events queued behind a busy conversation give up here, before any
    /// turn is appended or placeholder posted.
    async fn lock_conversation(&self, channel_id: &str) -> Option<ConversationGuard> {
        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => None,
            guard = self.store.lock(channel_id) => Some(guard),
        }
    }

    /// `send_once` unless shutdown fires first
    async fn request_once(
        &self,
        backend: &dyn BackendAdapter,
        history: &[Turn],
    ) -> Option<Result<String>> {
        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => None,
            reply = backend.send_once(history) => Some(reply),
        }
    }

    /// Post a complete answer as one message
    async fn deliver(&self, channel_id: &str, reply: String) -> DispatchOutcome {
        match self.chat.send_message(channel_id, &reply).await {
            Ok(_) => {
                tracing::info!(channel_id, reply_len = reply.len(), "Reply sent");
                DispatchOutcome::Replied { text: reply }
            }
            Err(e) => self.report(channel_id, FailureSite::Edit, e).await,
        }
    }

    /// Log a failure and post its notice
    async fn report(
        &self,
        channel_id: &str,
        site: FailureSite,
        error: BridgeError,
    ) -> DispatchOutcome {
        tracing::error!(
            channel_id,
            site = ?site,
            kind = error.kind(),
            error = %error,
            "Round trip failed"
        );
        if let Err(e) = self.chat.send_message(channel_id, site.notice()).await {
            tracing::warn!(channel_id, error = %e, "Failed to post failure notice");
        }
        DispatchOutcome::Failed { site, error }
    }
}
