//! Generate Message Backend
//!
//! Adapter for the PaLM `generateMessage` API. Each call returns whole
//! candidates, so this backend does not stream; the dispatcher sends its
//! answer in one message.
//!
//! History turns become author-tagged messages (`user` / `bot`). The seed turn
//! has no author in this API and is sent as the prompt context instead.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::status_error;
use super::traits::{BackendAdapter, BackendConfig, REQUEST_TIMEOUT};
use crate::conversation::{Role, Turn};
use crate::error::{BridgeError, Result};

/// Author label for user turns
const USER_AUTHOR: &str = "user";
/// Author label for assistant turns
const BOT_AUTHOR: &str = "bot";

/// Generate message backend client
#[derive(Clone)]
pub struct GenerateMessageBackend {
    /// API base URL
    base_url: String,
    /// API key (query parameter)
    api_key: String,
    /// Model identifier
    model: String,
    /// Sampling temperature
    temperature: f32,
    /// HTTP client
    http_client: reqwest::Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    prompt: MessagePrompt<'a>,
    temperature: f32,
    candidate_count: u32,
}

#[derive(Debug, Serialize)]
struct MessagePrompt<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a str>,
    messages: Vec<AuthoredMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct AuthoredMessage<'a> {
    author: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    filters: Vec<ContentFilter>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct ContentFilter {
    #[serde(default)]
    reason: String,
}

impl GenerateMessageBackend {
    /// Create a new generate message backend
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        temperature: f32,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BridgeError::Transport(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: temperature.clamp(0.0, 1.0),
            http_client,
        })
    }

    /// Create from [`BackendConfig`]
    ///
    /// # Errors
    ///
    /// Fails if the configuration describes another backend kind.
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        match config {
            BackendConfig::GenerateMessage {
                base_url,
                api_key,
                model,
                temperature,
            } => Self::new(base_url.clone(), api_key.clone(), model.clone(), *temperature),
            BackendConfig::ChatCompletion { .. } => Err(BridgeError::Backend(
                "expected a generate_message backend configuration".to_string(),
            )),
        }
    }

    fn generate_url(&self) -> String {
        format!("{}/models/{}:generateMessage", self.base_url, self.model)
    }

    fn build_request<'a>(&self, history: &'a [Turn]) -> GenerateRequest<'a> {
        let mut context = None;
        let mut messages = Vec::with_capacity(history.len());

        for turn in history {
            match turn.role() {
                Role::System => context = Some(turn.text()),
                Role::User => messages.push(AuthoredMessage {
                    author: USER_AUTHOR,
                    content: turn.text(),
                }),
                Role::Assistant => messages.push(AuthoredMessage {
                    author: BOT_AUTHOR,
                    content: turn.text(),
                }),
            }
        }

        GenerateRequest {
            prompt: MessagePrompt { context, messages },
            temperature: self.temperature,
            candidate_count: 1,
        }
    }
}

#[async_trait]
impl BackendAdapter for GenerateMessageBackend {
    fn name(&self) -> &str {
        "generate-message"
    }

    fn supports_streaming(&self) -> bool {
        false
    }

    async fn send_once(&self, history: &[Turn]) -> Result<String> {
        let request = self.build_request(history);
        tracing::debug!(
            model = %self.model,
            messages = request.prompt.messages.len(),
            "Sending generateMessage request"
        );

        let response = self
            .http_client
            .post(self.generate_url())
            .query(&[("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let body: GenerateResponse = response.json().await?;
        match body.candidates.into_iter().next() {
            Some(candidate) => Ok(candidate.content),
            None if !body.filters.is_empty() => {
                let reasons: Vec<String> = body.filters.into_iter().map(|f| f.reason).collect();
                Err(BridgeError::Backend(format!(
                    "no candidates returned (filtered: {})",
                    reasons.join(", ")
                )))
            }
            None => Err(BridgeError::Backend(
                "no candidates returned".to_string(),
            )),
        }
    }
}
