//! Bridge Daemon - Chat-to-LLM Relay Server
//!
//! Entry point for the bridge daemon. A gateway relay forwards chat events to
//! this process over a Unix socket; answers go back to the chat platform over
//! its REST API.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (~/.config/llm-bridge/bridge.toml)
//! bridge-daemon
//!
//! # Custom socket path and config file
//! bridge-daemon --socket-path /tmp/bridge.sock --config /etc/llm-bridge/bridge.toml
//!
//! # Shorter history, more frequent edits
//! bridge-daemon --window-size 4 --publish-every 5
//!
//! # Verbose logging (an explicit --log-level wins over RUST_LOG)
//! bridge-daemon --log-level debug
//! RUST_LOG=debug,hyper=info bridge-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown (in-flight answers are cancelled)

mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use bridge_core::{
    default_config_path, load_config_from_path, ChatPlatform, ConfigOverrides, Dispatcher,
    DiscordRest,
};

use server::{EventServer, ServerConfig};

/// Bridge Daemon - relays chat messages to LLM backends
#[derive(Parser, Debug)]
#[command(name = "bridge-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Unix socket path for inbound events
    #[arg(short = 's', long, env = "BRIDGE_SOCKET", value_name = "PATH")]
    socket_path: Option<PathBuf>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "BRIDGE_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides RUST_LOG
    #[arg(short = 'l', long, env = "BRIDGE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Non-seed turns kept per conversation
    #[arg(long, value_name = "N")]
    window_size: Option<usize>,

    /// Publish a partial answer after every N fragments
    #[arg(long, value_name = "N")]
    publish_every: Option<u32>,

    /// System prompt that opens every conversation
    #[arg(long, value_name = "TEXT")]
    seed_prompt: Option<String>,

    /// Seconds to wait for in-flight answers on shutdown
    #[arg(long, default_value_t = 5, value_name = "SECS")]
    shutdown_grace: u64,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(window) = self.window_size {
            overrides = overrides.with_window_size(window);
        }
        if let Some(every) = self.publish_every {
            overrides = overrides.with_publish_every(every);
        }
        if let Some(ref seed) = self.seed_prompt {
            overrides = overrides.with_seed_prompt(seed.clone());
        }
        overrides
    }
}

/// Get the default socket path
///
/// Uses XDG_RUNTIME_DIR if available, otherwise /tmp/llm-bridge-$UID/
fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir)
            .join("llm-bridge")
            .join("bridge.sock")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/llm-bridge-{uid}/bridge.sock"))
    }
}

const DEFAULT_LOG_LEVEL: &str = "info";

/// Filter directives: an explicit level, then `RUST_LOG`, then the default
fn log_directives(level: Option<&str>, rust_log: Option<String>) -> String {
    let crate_directives = |level: &str| format!("bridge_daemon={level},bridge_core={level}");
    match (level, rust_log) {
        (Some(level), _) => crate_directives(level),
        (None, Some(rust_log)) if !rust_log.trim().is_empty() => rust_log,
        (None, _) => crate_directives(DEFAULT_LOG_LEVEL),
    }
}

/// Initialize logging
fn init_logging(level: Option<&str>) {
    let directives = log_directives(level, std::env::var("RUST_LOG").ok());
    let filter = tracing_subscriber::EnvFilter::new(directives);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.log_level.as_deref());

    info!("Bridge Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    // Resolve configuration: file < env < CLI
    let config_path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(config_path).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        source = %config.source(),
        config_file = ?config.config_file_path,
        window_size = config.window_size,
        publish_every = config.publish_every,
        channels = config.channels.len(),
        "Configuration loaded"
    );
    if config.chat.token.is_empty() {
        warn!("No chat token configured (set DISCORD_TOKEN); replies will be rejected");
    }
    if config.channels.is_empty() {
        warn!("No channels routed; every event will be ignored");
    }

    // Wire the dispatcher
    let shutdown = CancellationToken::new();
    let chat: Arc<dyn ChatPlatform> = Arc::new(
        DiscordRest::with_api_base(config.chat.token.clone(), config.chat.api_base.clone())
            .context("Failed to create chat client")?,
    );
    let dispatcher = Dispatcher::from_config(&config, chat)
        .context("Failed to build backends")?
        .with_shutdown(shutdown.clone());
    info!(routes = dispatcher.route_count(), "Dispatcher ready");

    // Setup signal handlers
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let shutdown_on_signal = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
        shutdown_on_signal.cancel();
    });

    // Create and run the event server
    let socket_path = args.socket_path.clone().unwrap_or_else(default_socket_path);
    let server = EventServer::new(socket_path, Arc::new(dispatcher)).with_config(ServerConfig {
        shutdown_grace: Duration::from_secs(args.shutdown_grace),
        ..ServerConfig::default()
    });
    info!(socket_path = ?server.socket_path(), "Socket path");

    match server.run(shutdown).await {
        Ok(()) => {
            info!("Bridge daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_overrides() {
        let args = Args::parse_from([
            "bridge-daemon",
            "--window-size",
            "3",
            "--publish-every",
            "7",
        ]);
        let mut config = bridge_core::BridgeConfig::default();
        args.overrides().apply(&mut config);
        assert_eq!(config.window_size, 3);
        assert_eq!(config.publish_every, 7);
        assert_eq!(args.shutdown_grace, 5);
    }

    #[test]
    fn test_args_defaults_leave_config_alone() {
        let args = Args::parse_from(["bridge-daemon"]);
        let mut config = bridge_core::BridgeConfig::default();
        args.overrides().apply(&mut config);
        assert_eq!(config.window_size, 8);
        assert_eq!(config.source(), bridge_core::ConfigSource::Default);
    }

    #[test]
    fn test_seed_prompt_flag() {
        let args = Args::parse_from(["bridge-daemon", "--seed-prompt", "Answer in haiku"]);
        let mut config = bridge_core::BridgeConfig::default();
        args.overrides().apply(&mut config);
        assert_eq!(config.seed_prompt, "Answer in haiku");
        assert_eq!(config.source(), bridge_core::ConfigSource::Cli);
    }

    #[test]
    fn test_log_level_flag_beats_rust_log() {
        assert_eq!(
            log_directives(Some("debug"), Some("warn".to_string())),
            "bridge_daemon=debug,bridge_core=debug"
        );
        assert_eq!(log_directives(None, Some("warn".to_string())), "warn");
        assert_eq!(
            log_directives(None, None),
            "bridge_daemon=info,bridge_core=info"
        );
        assert_eq!(
            log_directives(None, Some("  ".to_string())),
            "bridge_daemon=info,bridge_core=info"
        );
    }

    #[test]
    fn test_default_socket_path() {
        let path = default_socket_path();
        assert!(path.to_string_lossy().ends_with("bridge.sock"));
    }
}
