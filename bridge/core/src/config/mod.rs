//! TOML Configuration File Support
//!
//! Centralized configuration loading for the bridge, from a TOML file at
//! `~/.config/llm-bridge/bridge.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (applied by the caller through [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! seed_prompt = "You are a professional assistant"
//!
//! [conversation]
//! window_size = 8
//!
//! [streaming]
//! publish_every = 10
//! typing_indicator = "Typing..."
//!
//! [chat]
//! bot_user_id = "1107100000000000000"
//!
//! [backends.openai]
//! kind = "chat_completion"
//! model = "gpt-3.5-turbo"
//! max_tokens = 512
//!
//! [backends.palm]
//! kind = "generate_message"
//! temperature = 0.75
//!
//! [[channels]]
//! id = "1107148758887710760"
//! backend = "openai"
//!
//! [[channels]]
//! id = "1108670964952211527"
//! backend = "palm"
//! ```
//!
//! # Environment Variables
//!
//! - `DISCORD_TOKEN`: chat bot token
//! - `BOT_USER_ID`: the bot's own user id (self-loop filter)
//! - `INITIAL_PROMPT`: seed prompt
//! - `API_KEY` / `BASE_URL`: key and endpoint of chat completion backends
//! - `PALM_API_KEY`: key of generate message backends
//! - `BRIDGE_WINDOW_SIZE`, `BRIDGE_PUBLISH_EVERY`: numeric tuning

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::BackendConfig;
use crate::chat::{DEFAULT_DISCORD_API, DEFAULT_TYPING_INDICATOR};
use crate::conversation::{DEFAULT_SEED_PROMPT, DEFAULT_WINDOW_SIZE};
use crate::streaming::DEFAULT_PUBLISH_EVERY;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Conversation section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationToml {
    /// Non-seed turns kept per conversation
    pub window_size: Option<usize>,
}

/// Streaming section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingToml {
    /// Publish a partial answer after every N fragments
    pub publish_every: Option<u32>,

    /// Placeholder text and trailing line on partial answers
    pub typing_indicator: Option<String>,
}

/// Chat platform section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatToml {
    /// Bot token
    pub token: Option<String>,

    /// The bot's own user id
    pub bot_user_id: Option<String>,

    /// REST API base URL
    pub api_base: Option<String>,
}

/// One `[[channels]]` entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRoute {
    /// Channel id used as conversation id
    pub id: String,

    /// Name of a `[backends.<name>]` entry
    pub backend: String,

    /// Keep a rolling history (false = one-shot completions)
    #[serde(default = "default_session")]
    pub session: bool,
}

fn default_session() -> bool {
    true
}

impl ChannelRoute {
    /// Route a channel to a named backend with history enabled
    pub fn new(id: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            backend: backend.into(),
            session: true,
        }
    }

    /// Route without conversation history
    #[must_use]
    pub fn one_shot(mut self) -> Self {
        self.session = false;
        self
    }
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeToml {
    /// Seed instruction every conversation starts with
    pub seed_prompt: Option<String>,

    /// Conversation configuration section
    pub conversation: ConversationToml,

    /// Streaming configuration section
    pub streaming: StreamingToml,

    /// Chat platform configuration section
    pub chat: ChatToml,

    /// Named backends
    pub backends: BTreeMap<String, BackendConfig>,

    /// Channel routes; also the allow-list of served channels
    pub channels: Vec<ChannelRoute>,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Chat platform settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatConfig {
    /// Bot token
    pub token: String,
    /// The bot's own user id
    pub bot_user_id: String,
    /// REST API base URL
    pub api_base: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            bot_user_id: String::new(),
            api_base: DEFAULT_DISCORD_API.to_string(),
        }
    }
}

/// Resolved bridge configuration
///
/// Use [`load_config`] to load configuration with proper priority handling.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Seed instruction every conversation starts with
    pub seed_prompt: String,

    /// Non-seed turns kept per conversation
    pub window_size: usize,

    /// Publish a partial answer after every N fragments
    pub publish_every: u32,

    /// Placeholder text and trailing line on partial answers
    pub typing_indicator: String,

    /// Chat platform settings
    pub chat: ChatConfig,

    /// Named backends
    pub backends: BTreeMap<String, BackendConfig>,

    /// Channel routes
    pub channels: Vec<ChannelRoute>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let mut backends = BTreeMap::new();
        backends.insert("openai".to_string(), BackendConfig::chat_completion(""));
        backends.insert("palm".to_string(), BackendConfig::generate_message(""));

        Self {
            seed_prompt: DEFAULT_SEED_PROMPT.to_string(),
            window_size: DEFAULT_WINDOW_SIZE,
            publish_every: DEFAULT_PUBLISH_EVERY,
            typing_indicator: DEFAULT_TYPING_INDICATOR.to_string(),
            chat: ChatConfig::default(),
            backends,
            channels: Vec::new(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl BridgeConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check invariants the rest of the bridge relies on
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(ConfigError::ValidationError(
                "conversation.window_size must be at least 1".to_string(),
            ));
        }
        if self.publish_every == 0 {
            return Err(ConfigError::ValidationError(
                "streaming.publish_every must be at least 1".to_string(),
            ));
        }
        for channel in &self.channels {
            if !self.backends.contains_key(&channel.backend) {
                return Err(ConfigError::ValidationError(format!(
                    "channel {} references unknown backend '{}'",
                    channel.id, channel.backend
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for channel in &self.channels {
            if !seen.insert(channel.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "channel {} is routed more than once",
                    channel.id
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/llm-bridge/bridge.toml` or
/// `~/.config/llm-bridge/bridge.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("llm-bridge").join("bridge.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if the
/// result fails validation. A missing config file is not an error.
pub fn load_config() -> Result<BridgeConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed, or
/// if the result fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<BridgeConfig, ConfigError> {
    load_with_env(path, |key| std::env::var(key).ok())
}

fn load_with_env(
    path: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<BridgeConfig, ConfigError> {
    // Start with defaults
    let mut config = BridgeConfig::default();

    // Try to load from file
    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: BridgeToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    // Apply environment variables (overrides file values)
    apply_env_config(&mut config, env);

    config.validate()?;
    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut BridgeConfig, toml: BridgeToml) {
    if let Some(seed) = toml.seed_prompt {
        config.seed_prompt = seed;
    }

    if let Some(window) = toml.conversation.window_size {
        config.window_size = window;
    }

    if let Some(every) = toml.streaming.publish_every {
        config.publish_every = every;
    }
    if let Some(indicator) = toml.streaming.typing_indicator {
        config.typing_indicator = indicator;
    }

    if let Some(token) = toml.chat.token {
        config.chat.token = token;
    }
    if let Some(id) = toml.chat.bot_user_id {
        config.chat.bot_user_id = id;
    }
    if let Some(base) = toml.chat.api_base {
        config.chat.api_base = base;
    }

    // A file that names its backends replaces the built-in pair
    if !toml.backends.is_empty() {
        config.backends = toml.backends;
    }
    config.channels = toml.channels;
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut BridgeConfig, env: impl Fn(&str) -> Option<String>) {
    let non_empty = |key: &str| env(key).filter(|v| !v.trim().is_empty());

    if let Some(token) = non_empty("DISCORD_TOKEN") {
        config.chat.token = token;
        config.source = ConfigSource::Env;
    }
    if let Some(id) = non_empty("BOT_USER_ID") {
        config.chat.bot_user_id = id;
        config.source = ConfigSource::Env;
    }
    if let Some(seed) = non_empty("INITIAL_PROMPT") {
        config.seed_prompt = seed;
        config.source = ConfigSource::Env;
    }

    let api_key = non_empty("API_KEY");
    let base_url = non_empty("BASE_URL");
    let palm_key = non_empty("PALM_API_KEY");
    for backend in config.backends.values_mut() {
        match backend {
            BackendConfig::ChatCompletion {
                api_key: key,
                base_url: url,
                ..
            } => {
                if let Some(ref value) = api_key {
                    key.clone_from(value);
                    config.source = ConfigSource::Env;
                }
                if let Some(ref value) = base_url {
                    url.clone_from(value);
                    config.source = ConfigSource::Env;
                }
            }
            BackendConfig::GenerateMessage { api_key: key, .. } => {
                if let Some(ref value) = palm_key {
                    key.clone_from(value);
                    config.source = ConfigSource::Env;
                }
            }
        }
    }

    if let Some(window) = non_empty("BRIDGE_WINDOW_SIZE") {
        if let Ok(n) = window.parse::<usize>() {
            config.window_size = n;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(every) = non_empty("BRIDGE_PUBLISH_EVERY") {
        if let Ok(n) = every.parse::<u32>() {
            config.publish_every = n;
            config.source = ConfigSource::Env;
        }
    }
}

// =============================================================================
// CLI Overrides
// =============================================================================

/// Values from command-line arguments, applied last
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Window size override
    pub window_size: Option<usize>,
    /// Publish interval override
    pub publish_every: Option<u32>,
    /// Seed prompt override
    pub seed_prompt: Option<String>,
}

impl ConfigOverrides {
    /// Create empty overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the window size
    #[must_use]
    pub fn with_window_size(mut self, window: usize) -> Self {
        self.window_size = Some(window);
        self
    }

    /// Override the publish interval
    #[must_use]
    pub fn with_publish_every(mut self, every: u32) -> Self {
        self.publish_every = Some(every);
        self
    }

    /// Override the seed prompt
    #[must_use]
    pub fn with_seed_prompt(mut self, seed: String) -> Self {
        self.seed_prompt = Some(seed);
        self
    }

    /// Apply the overrides; call [`BridgeConfig::validate`] afterwards
    pub fn apply(&self, config: &mut BridgeConfig) {
        if let Some(window) = self.window_size {
            config.window_size = window;
            config.source = ConfigSource::Cli;
        }
        if let Some(every) = self.publish_every {
            config.publish_every = every;
            config.source = ConfigSource::Cli;
        }
        if let Some(ref seed) = self.seed_prompt {
            config.seed_prompt.clone_from(seed);
            config.source = ConfigSource::Cli;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn write_toml(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.seed_prompt, "You are a professional assistant");
        assert_eq!(config.window_size, 8);
        assert_eq!(config.publish_every, 10);
        assert_eq!(config.typing_indicator, "Typing...");
        assert_eq!(config.chat.api_base, "https://discord.com/api/v10");
        assert!(config.backends.contains_key("openai"));
        assert!(config.backends.contains_key("palm"));
        assert!(config.channels.is_empty());
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(p) = default_config_path() {
            assert!(p.to_string_lossy().contains("llm-bridge"));
            assert!(p.to_string_lossy().ends_with("bridge.toml"));
        }
    }

    #[test]
    fn test_parse_valid_toml() {
        let file = write_toml(
            r#"
seed_prompt = "Answer in haiku"

[conversation]
window_size = 4

[streaming]
publish_every = 2
typing_indicator = "..."

[chat]
bot_user_id = "bot-1"

[backends.gpt]
kind = "chat_completion"
base_url = "http://localhost:8080/v1"
max_tokens = 20

[backends.bison]
kind = "generate_message"

[[channels]]
id = "100"
backend = "gpt"

[[channels]]
id = "200"
backend = "bison"
session = false
"#,
        );

        let config = load_with_env(Some(file.path().to_path_buf()), no_env).unwrap();

        assert_eq!(config.seed_prompt, "Answer in haiku");
        assert_eq!(config.window_size, 4);
        assert_eq!(config.publish_every, 2);
        assert_eq!(config.typing_indicator, "...");
        assert_eq!(config.chat.bot_user_id, "bot-1");
        assert_eq!(config.backends.len(), 2);
        assert_eq!(
            config.backends["gpt"].base_url(),
            "http://localhost:8080/v1"
        );
        assert_eq!(
            config.channels,
            vec![
                ChannelRoute::new("100", "gpt"),
                ChannelRoute::new("200", "bison").one_shot(),
            ]
        );
        assert_eq!(config.source(), ConfigSource::File);
    }

    #[test]
    fn test_parse_empty_toml() {
        let file = write_toml("");
        let config = load_with_env(Some(file.path().to_path_buf()), no_env).unwrap();
        assert_eq!(config.window_size, DEFAULT_WINDOW_SIZE);
        assert_eq!(config.backends.len(), 2);
    }

    #[test]
    fn test_missing_file_graceful() {
        let config = load_with_env(
            Some(PathBuf::from("/nonexistent/llm-bridge/bridge.toml")),
            no_env,
        )
        .unwrap();
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_malformed_toml_error() {
        let file = write_toml("[conversation\nwindow_size = ");
        let result = load_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let file = write_toml(
            r#"
[[channels]]
id = "100"
backend = "missing"
"#,
        );
        let result = load_with_env(Some(file.path().to_path_buf()), no_env);
        match result {
            Err(ConfigError::ValidationError(msg)) => assert!(msg.contains("missing")),
            other => panic!("Expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_window_rejected() {
        let file = write_toml("[conversation]\nwindow_size = 0\n");
        let result = load_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_duplicate_channel_rejected() {
        let mut config = BridgeConfig::default();
        config.channels = vec![
            ChannelRoute::new("1", "openai"),
            ChannelRoute::new("1", "palm"),
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let file = write_toml(
            r#"
seed_prompt = "from file"

[conversation]
window_size = 4
"#,
        );
        let env: HashMap<&str, &str> = [
            ("INITIAL_PROMPT", "from env"),
            ("DISCORD_TOKEN", "tok"),
            ("API_KEY", "sk-env"),
            ("BASE_URL", "http://proxy/v1"),
            ("PALM_API_KEY", "palm-env"),
            ("BRIDGE_WINDOW_SIZE", "6"),
            ("BRIDGE_PUBLISH_EVERY", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let config = load_with_env(Some(file.path().to_path_buf()), |key| {
            env.get(key).map(|v| (*v).to_string())
        })
        .unwrap();

        assert_eq!(config.seed_prompt, "from env");
        assert_eq!(config.chat.token, "tok");
        assert_eq!(config.window_size, 6);
        assert_eq!(config.publish_every, DEFAULT_PUBLISH_EVERY);
        assert_eq!(config.backends["openai"].api_key(), "sk-env");
        assert_eq!(config.backends["openai"].base_url(), "http://proxy/v1");
        assert_eq!(config.backends["palm"].api_key(), "palm-env");
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_blank_env_is_ignored() {
        let config = load_with_env(None, |key| {
            (key == "INITIAL_PROMPT").then(|| "   ".to_string())
        })
        .unwrap();
        assert_eq!(config.seed_prompt, DEFAULT_SEED_PROMPT);
    }

    #[test]
    fn test_cli_overrides_env() {
        let mut config = load_with_env(None, |key| {
            (key == "BRIDGE_WINDOW_SIZE").then(|| "6".to_string())
        })
        .unwrap();

        ConfigOverrides::new()
            .with_window_size(3)
            .with_publish_every(5)
            .with_seed_prompt("from cli".to_string())
            .apply(&mut config);

        assert_eq!(config.window_size, 3);
        assert_eq!(config.publish_every, 5);
        assert_eq!(config.seed_prompt, "from cli");
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_config_overrides_empty_no_change() {
        let mut config = BridgeConfig::default();
        ConfigOverrides::new().apply(&mut config);
        assert_eq!(config.window_size, DEFAULT_WINDOW_SIZE);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_config_source_display() {
        assert_eq!(ConfigSource::Cli.to_string(), "CLI");
        assert_eq!(ConfigSource::Env.to_string(), "environment");
        assert_eq!(ConfigSource::File.to_string(), "config file");
        assert_eq!(ConfigSource::Default.to_string(), "default");
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::ValidationError("bad value".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: bad value");

        let err = ConfigError::ReadError {
            path: PathBuf::from("/test/path"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        assert!(err.to_string().contains("/test/path"));
    }
}
