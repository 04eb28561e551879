//! Chat Completion Backend
//!
//! Adapter for OpenAI-compatible chat completion APIs.
//!
//! # API
//!
//! - `POST {base_url}/chat/completions` with `stream: false` returns one JSON
//!   body whose first choice carries the answer.
//! - The same request with `stream: true` answers with server-sent events:
//!   `data: {chunk}` lines carrying `choices[0].delta.content`, terminated by
//!   `data: [DONE]` or by the end of the response body.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use super::traits::{
    BackendAdapter, BackendConfig, Fragment, FragmentSender, FragmentStream, REQUEST_TIMEOUT,
};
use super::{error_payload, status_error};
use crate::conversation::Turn;
use crate::error::{BridgeError, Result};

/// Chat completion backend client
#[derive(Clone)]
pub struct ChatCompletionBackend {
    /// API base URL
    base_url: String,
    /// Bearer token
    api_key: String,
    /// Model identifier
    model: String,
    /// Token cap per answer
    max_tokens: u32,
    /// HTTP client
    http_client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Meaning of one SSE line
#[derive(Debug, PartialEq, Eq)]
enum SseLine {
    /// Text to forward
    Delta(String),
    /// Comment, keep-alive, role-only delta, or another line without text
    Skip,
    /// `data: [DONE]`
    Done,
    /// Error payload or undecodable chunk
    Error(BridgeError),
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();

    if data == "[DONE]" {
        return SseLine::Done;
    }
    if let Some(message) = error_payload(data) {
        return SseLine::Error(BridgeError::Stream(message));
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta)
            .and_then(|delta| delta.content)
            .filter(|content| !content.is_empty())
            .map_or(SseLine::Skip, SseLine::Delta),
        Err(e) => SseLine::Error(BridgeError::Stream(format!("malformed chunk: {e}"))),
    }
}

impl ChatCompletionBackend {
    /// Create a new chat completion backend
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        max_tokens: u32,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BridgeError::Transport(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens,
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
            BackendConfig::ChatCompletion {
                base_url,
                api_key,
                model,
                max_tokens,
            } => Self::new(base_url.clone(), api_key.clone(), model.clone(), *max_tokens),
            BackendConfig::GenerateMessage { .. } => Err(BridgeError::Backend(
                "expected a chat_completion backend configuration".to_string(),
            )),
        }
    }

    /// Model this backend requests
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_request<'a>(&'a self, history: &'a [Turn], stream: bool) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: history
                .iter()
                .map(|turn| ChatMessage {
                    role: turn.role().as_str(),
                    content: turn.text(),
                })
                .collect(),
            max_tokens: self.max_tokens,
            stream,
        }
    }

    async fn post(&self, history: &[Turn], stream: bool) -> Result<reqwest::Response> {
        let response = self
            .http_client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&self.build_request(history, stream))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        Ok(response)
    }
}

/// Byte buffer that yields complete SSE lines
///
/// Network chunks may split a multi-byte character, so bytes are only decoded
/// once a whole line has arrived.
#[derive(Debug, Default)]
struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    fn extend(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    /// Next complete line, trimmed, if a newline has arrived
    fn next_line(&mut self) -> Option<Result<String>> {
        let pos = self.bytes.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.bytes.drain(..=pos).collect();
        Some(decode_line(&line[..pos]))
    }

    /// Whatever is left once the body has ended
    fn finish(self) -> Result<String> {
        decode_line(&self.bytes)
    }
}

fn decode_line(bytes: &[u8]) -> Result<String> {
    std::str::from_utf8(bytes)
        .map(|line| line.trim().to_string())
        .map_err(|e| BridgeError::Stream(format!("invalid UTF-8 in event stream: {e}")))
}

fn classify(line: Result<String>) -> SseLine {
    match line {
        Ok(line) => parse_sse_line(&line),
        Err(e) => SseLine::Error(e),
    }
}

/// Forward SSE lines from a response body until a terminal item is sent
async fn pump_events(response: reqwest::Response, tx: FragmentSender) {
    let mut body = response.bytes_stream();
    let mut buffer = LineBuffer::default();
    let mut fragments = 0u32;

    while let Some(chunk) = body.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tx
                    .send(Fragment::Failed(BridgeError::Stream(e.to_string())))
                    .await;
                return;
            }
        };
        buffer.extend(&bytes);

        while let Some(line) = buffer.next_line() {
            let fragment = match classify(line) {
                SseLine::Skip => continue,
                SseLine::Delta(text) => {
                    fragments += 1;
                    Fragment::Delta(text)
                }
                SseLine::Done => Fragment::Done,
                SseLine::Error(err) => Fragment::Failed(err),
            };

            let terminal = fragment.is_terminal();
            if tx.send(fragment).await.is_err() {
                // Receiver dropped, stop streaming
                return;
            }
            if terminal {
                tracing::debug!(fragments, "Chat completion stream finished");
                return;
            }
        }
    }

    // Body ended without [DONE]; flush a trailing unterminated line
    let tail = match classify(buffer.finish()) {
        SseLine::Delta(text) => Some(Fragment::Delta(text)),
        SseLine::Error(err) => {
            let _ = tx.send(Fragment::Failed(err)).await;
            return;
        }
        SseLine::Skip | SseLine::Done => None,
    };
    if let Some(fragment) = tail {
        if tx.send(fragment).await.is_err() {
            return;
        }
    }
    tracing::debug!(fragments, "Chat completion body ended");
    let _ = tx.send(Fragment::Done).await;
}

#[async_trait]
impl BackendAdapter for ChatCompletionBackend {
    fn name(&self) -> &str {
        "chat-completion"
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn send_once(&self, history: &[Turn]) -> Result<String> {
        let response = self.post(history, false).await?;
        let body: ChatResponse = response.json().await?;

        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| BridgeError::Backend("response contained no choices".to_string()))
    }

    async fn send_streaming(&self, history: &[Turn]) -> Result<FragmentStream> {
        let response = self.post(history, true).await?;
        let (tx, stream) = FragmentStream::channel();
        let reader = tokio::spawn(pump_events(response, tx));
        Ok(stream.with_reader(reader))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Role;

    fn backend() -> ChatCompletionBackend {
        ChatCompletionBackend::new("https://api.example.com/v1/", "sk-test", "gpt-test", 20)
            .unwrap()
    }

    #[test]
    fn test_completions_url_trims_slash() {
        assert_eq!(
            backend().completions_url(),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_request_carries_roles_and_cap() {
        let backend = backend();
        let history = vec![
            Turn::new(Role::System, "be brief"),
            Turn::new(Role::User, "hi"),
            Turn::new(Role::Assistant, "hello"),
        ];
        let request = serde_json::to_value(backend.build_request(&history, true)).unwrap();

        assert_eq!(
            request,
            serde_json::json!({
                "model": "gpt-test",
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "hi"},
                    {"role": "assistant", "content": "hello"},
                ],
                "max_tokens": 20,
                "stream": true,
            })
        );
    }

    #[test]
    fn test_parse_sse_delta() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#;
        assert_eq!(parse_sse_line(line), SseLine::Delta("Hel".to_string()));
    }

    #[test]
    fn test_parse_sse_role_only_delta_is_skipped() {
        let line = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_sse_line(line), SseLine::Skip);
        assert_eq!(parse_sse_line(": keep-alive"), SseLine::Skip);
        assert_eq!(parse_sse_line(""), SseLine::Skip);
    }

    #[test]
    fn test_parse_sse_done_and_errors() {
        assert_eq!(parse_sse_line("data: [DONE]"), SseLine::Done);
        assert_eq!(
            parse_sse_line(r#"data: {"error":{"message":"overloaded"}}"#),
            SseLine::Error(BridgeError::Stream("overloaded".to_string()))
        );
        assert!(matches!(
            parse_sse_line("data: {not json"),
            SseLine::Error(BridgeError::Stream(_))
        ));
    }

    #[test]
    fn test_line_buffer_joins_split_character() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"你好\"}}]}\n".as_bytes();
        let split = line.iter().position(|&b| b == 0xE4).unwrap() + 1;

        let mut buffer = LineBuffer::default();
        buffer.extend(&line[..split]);
        assert!(buffer.next_line().is_none());
        buffer.extend(&line[split..]);

        let decoded = buffer.next_line().unwrap().unwrap();
        assert_eq!(parse_sse_line(&decoded), SseLine::Delta("你好".to_string()));
        assert!(buffer.next_line().is_none());
    }

    #[test]
    fn test_line_buffer_rejects_invalid_utf8() {
        let mut buffer = LineBuffer::default();
        buffer.extend(b"data: \xFF\xFE\n");
        assert!(matches!(
            buffer.next_line(),
            Some(Err(BridgeError::Stream(_)))
        ));
    }

    #[test]
    fn test_line_buffer_finish_returns_tail() {
        let mut buffer = LineBuffer::default();
        buffer.extend(b"data: [DONE]\n: ping");
        assert_eq!(buffer.next_line().unwrap().unwrap(), "data: [DONE]");
        assert_eq!(buffer.finish().unwrap(), ": ping");
    }

    #[test]
    fn test_from_config_rejects_other_kind() {
        let config = BackendConfig::generate_message("key");
        assert!(ChatCompletionBackend::from_config(&config).is_err());

        let config = BackendConfig::chat_completion("key");
        let backend = ChatCompletionBackend::from_config(&config).unwrap();
        assert_eq!(backend.model(), "gpt-3.5-turbo");
    }
}
