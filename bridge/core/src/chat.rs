//! Chat Platform Client
//!
//! Outbound operations the bridge needs from the chat platform: send a new
//! message and edit one it sent earlier. [`DiscordRest`] implements them over
//! the Discord REST API; tests substitute in-memory implementations.
//!
//! [`MessagePublisher`] adapts these operations to the streaming
//! [`Publisher`] contract: it edits a placeholder message in place as the
//! answer grows.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::streaming::Publisher;

/// Default Discord REST API base
pub const DEFAULT_DISCORD_API: &str = "https://discord.com/api/v10";

/// Placeholder and trailing indicator shown while an answer streams
pub const DEFAULT_TYPING_INDICATOR: &str = "Typing...";

/// Chat platform message identifier
pub type MessageId = String;

/// Outbound chat operations
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Post a new message and return its id
    async fn send_message(&self, channel_id: &str, text: &str) -> Result<MessageId>;

    /// Replace the content of an existing message
    async fn edit_message(&self, channel_id: &str, message_id: &str, text: &str) -> Result<()>;
}

#[derive(Serialize)]
struct MessageBody<'a> {
    content: &'a str,
}

#[derive(Deserialize)]
struct MessageCreated {
    id: String,
}

/// Discord REST client for a bot account
#[derive(Clone)]
pub struct DiscordRest {
    /// API base URL
    api_base: String,
    /// Bot token (without the `Bot ` prefix)
    token: String,
    /// HTTP client
    http_client: reqwest::Client,
}

impl DiscordRest {
    /// Create a client against the default API base
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] if the HTTP client cannot be built.
    pub fn new(token: impl Into<String>) -> Result<Self> {
        Self::with_api_base(token, DEFAULT_DISCORD_API)
    }

    /// Create a client against a custom API base
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] if the HTTP client cannot be built.
    pub fn with_api_base(token: impl Into<String>, api_base: impl Into<String>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BridgeError::Transport(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
            http_client,
        })
    }

    fn messages_url(&self, channel_id: &str) -> String {
        format!("{}/channels/{}/messages", self.api_base, channel_id)
    }

    fn message_url(&self, channel_id: &str, message_id: &str) -> String {
        format!("{}/{}", self.messages_url(channel_id), message_id)
    }

    fn authorization(&self) -> String {
        format!("Bot {}", self.token)
    }
}

/// Map a non-success chat response to a publish error
async fn publish_error(response: reqwest::Response) -> BridgeError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    BridgeError::Publish(format!("{status}: {body}"))
}

#[async_trait]
impl ChatPlatform for DiscordRest {
    async fn send_message(&self, channel_id: &str, text: &str) -> Result<MessageId> {
        let response = self
            .http_client
            .post(self.messages_url(channel_id))
            .header(reqwest::header::AUTHORIZATION, self.authorization())
            .json(&MessageBody { content: text })
            .send()
            .await
            .map_err(|e| BridgeError::Publish(e.to_string()))?;

        if !response.status().is_success() {
            return Err(publish_error(response).await);
        }

        let created: MessageCreated = response
            .json()
            .await
            .map_err(|e| BridgeError::Publish(format!("unexpected message body: {e}")))?;
        Ok(created.id)
    }

    async fn edit_message(&self, channel_id: &str, message_id: &str, text: &str) -> Result<()> {
        let response = self
            .http_client
            .patch(self.message_url(channel_id, message_id))
            .header(reqwest::header::AUTHORIZATION, self.authorization())
            .json(&MessageBody { content: text })
            .send()
            .await
            .map_err(|e| BridgeError::Publish(e.to_string()))?;

        if !response.status().is_success() {
            return Err(publish_error(response).await);
        }
        Ok(())
    }
}

/// Publishes a growing answer by editing one chat message
pub struct MessagePublisher<'a, C: ChatPlatform + ?Sized> {
    chat: &'a C,
    channel_id: &'a str,
    message_id: &'a str,
    typing_indicator: &'a str,
}

impl<'a, C: ChatPlatform + ?Sized> MessagePublisher<'a, C> {
    /// Edit `message_id` in `channel_id`; partial edits end with `typing_indicator`
    pub fn new(
        chat: &'a C,
        channel_id: &'a str,
        message_id: &'a str,
        typing_indicator: &'a str,
    ) -> Self {
        Self {
            chat,
            channel_id,
            message_id,
            typing_indicator,
        }
    }

    /// Content shown for a publish
    fn render(&self, text: &str, is_final: bool) -> String {
        if is_final || self.typing_indicator.is_empty() {
            text.to_string()
        } else {
            format!("{text}\n{}", self.typing_indicator)
        }
    }
}

#[async_trait]
impl<C: ChatPlatform + ?Sized> Publisher for MessagePublisher<'_, C> {
    async fn publish(&self, text: &str, is_final: bool) -> Result<()> {
        let content = self.render(text, is_final);
        self.chat
            .edit_message(self.channel_id, self.message_id, &content)
            .await
    }
}
