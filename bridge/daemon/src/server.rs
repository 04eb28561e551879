//! Event Server Implementation
//!
//! Accepts newline-delimited JSON inbound events on a Unix socket and
//! dispatches each one on its own task:
//!
//! ```text
//!   gateway relay ──(conn-1)──┐
//!                             ├──▶ EventServer ──▶ tokio::spawn(dispatch(event))
//!   replay tool  ──(conn-2)──┘
//! ```
//!
//! Each line is one [`InboundEvent`]:
//!
//! ```text
//! {"event_id":"1","author_id":"42","channel_id":"1107148758887710760","text":"hello"}
//! ```
//!
//! Malformed lines are logged and skipped; the connection stays open.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};

use bridge_core::{DispatchOutcome, Dispatcher, InboundEvent};

/// Configuration for the event server
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// How long shutdown waits for in-flight dispatches
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 16,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Parse one NDJSON line; blank lines yield `None`
pub fn parse_event(line: &str) -> Result<Option<InboundEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let event = serde_json::from_str(line).context("Malformed inbound event")?;
    Ok(Some(event))
}

/// The inbound event server
pub struct EventServer {
    /// Path to the Unix socket
    socket_path: PathBuf,
    /// Dispatcher shared by every event task
    dispatcher: Arc<Dispatcher>,
    /// Server configuration
    server_config: ServerConfig,
    /// Connection and dispatch tasks
    tasks: TaskTracker,
}

impl EventServer {
    /// Create a new event server
    pub fn new(socket_path: PathBuf, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            socket_path,
            dispatcher,
            server_config: ServerConfig::default(),
            tasks: TaskTracker::new(),
        }
    }

    /// Replace the server configuration
    #[must_use]
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.server_config = config;
        self
    }

    /// Path the server listens on
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Get peer credentials from Unix socket
    #[cfg(target_os = "linux")]
    fn get_peer_uid(stream: &UnixStream) -> Option<u32> {
        use std::os::unix::io::AsRawFd;

        let fd = stream.as_raw_fd();
        let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        let result = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                &mut cred as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };

        if result == 0 {
            Some(cred.uid)
        } else {
            None
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn get_peer_uid(_stream: &UnixStream) -> Option<u32> {
        None
    }

    /// Prepare the socket path (create directory, remove stale socket)
    fn prepare_socket(&self) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create socket directory: {parent:?}"))?;
                info!(path = ?parent, "Created socket directory");
            }
        }

        if self.socket_path.exists() {
            warn!(path = ?self.socket_path, "Removing stale socket file");
            fs::remove_file(&self.socket_path).with_context(|| {
                format!("Failed to remove stale socket: {:?}", self.socket_path)
            })?;
        }

        Ok(())
    }

    /// Bind the socket and serve until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.prepare_socket()?;

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind to {:?}", self.socket_path))?;

        // Owner-only
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.socket_path, perms)?;
        }

        info!(path = ?self.socket_path, "Listening for inbound events");

        let our_uid = unsafe { libc::getuid() };
        let mut next_conn = 0u64;
        let active = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        loop {
            let accepted = tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping accept loop");
                    break;
                }
                accepted = listener.accept() => accepted,
            };

            let stream = match accepted {
                Ok((stream, _addr)) => stream,
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    continue;
                }
            };

            if active.load(std::sync::atomic::Ordering::SeqCst) >= self.server_config.max_connections
            {
                warn!("Connection limit reached, rejecting new connection");
                drop(stream);
                continue;
            }

            // Validate peer (same UID as daemon)
            let peer_uid = Self::get_peer_uid(&stream);
            if let Some(uid) = peer_uid {
                if uid != our_uid && uid != 0 {
                    warn!(
                        peer_uid = uid,
                        our_uid = our_uid,
                        "Rejecting connection from different user"
                    );
                    drop(stream);
                    continue;
                }
            }

            next_conn += 1;
            let conn_id = next_conn;
            info!(conn_id, peer_uid = ?peer_uid, "New connection accepted");

            let dispatcher = Arc::clone(&self.dispatcher);
            let tasks = self.tasks.clone();
            let shutdown = shutdown.clone();
            let active = Arc::clone(&active);
            active.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

            self.tasks.spawn(
                async move {
                    Self::handle_connection(stream, dispatcher, tasks, shutdown).await;
                    active.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                }
                .instrument(tracing::info_span!("connection", conn_id)),
            );
        }

        self.shutdown().await
    }

    /// Read events from one connection until EOF or shutdown
    async fn handle_connection(
        stream: UnixStream,
        dispatcher: Arc<Dispatcher>,
        tasks: TaskTracker,
        shutdown: CancellationToken,
    ) {
        let mut lines = BufReader::new(stream).lines();

        loop {
            let line = tokio::select! {
                () = shutdown.cancelled() => break,
                line = lines.next_line() => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!("Client disconnected (EOF)");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Read error");
                    break;
                }
            };

            let event = match parse_event(&line) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "Skipping line");
                    continue;
                }
            };

            debug!(event_id = %event.event_id, "Received event");
            let dispatcher = Arc::clone(&dispatcher);
            let span = tracing::info_span!("event", event_id = %event.event_id);
            tasks.spawn(
                async move {
                    match dispatcher.dispatch(event).await {
                        DispatchOutcome::Failed { site, error } => {
                            debug!(site = ?site, error = %error, "Dispatch failed");
                        }
                        outcome => debug!(outcome = ?outcome, "Dispatch finished"),
                    }
                }
                .instrument(span),
            );
        }
    }

    /// Graceful shutdown
    async fn shutdown(&self) -> Result<()> {
        info!(in_flight = self.tasks.len(), "Initiating graceful shutdown");

        self.tasks.close();
        if tokio::time::timeout(self.server_config.shutdown_grace, self.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.tasks.len(),
                "Shutdown grace period elapsed with tasks still running"
            );
        }

        if self.socket_path.exists() {
            fs::remove_file(&self.socket_path)
                .with_context(|| format!("Failed to remove socket: {:?}", self.socket_path))?;
            info!(path = ?self.socket_path, "Socket file removed");
        }

        info!("Shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_core::chat::{ChatPlatform, MessageId};
    use bridge_core::conversation::Turn;
    use bridge_core::{BackendAdapter, ConversationStore, Result as BridgeResult, Route};
    use parking_lot::Mutex;
    use tokio::io::AsyncWriteExt;

    #[derive(Default)]
    struct RecordingChat {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChatPlatform for RecordingChat {
        async fn send_message(&self, _channel_id: &str, text: &str) -> BridgeResult<MessageId> {
            self.sent.lock().push(text.to_string());
            Ok("m".to_string())
        }

        async fn edit_message(&self, _channel_id: &str, _id: &str, _text: &str) -> BridgeResult<()> {
            Ok(())
        }
    }

    struct Upper;

    #[async_trait]
    impl BackendAdapter for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn supports_streaming(&self) -> bool {
            false
        }

        async fn send_once(&self, history: &[Turn]) -> BridgeResult<String> {
            Ok(history
                .last()
                .map(|t| t.text().to_uppercase())
                .unwrap_or_default())
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 16);
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
    }

    #[test]
    fn test_parse_event() {
        let event = parse_event(
            r#"{"event_id":"1","author_id":"u","channel_id":"c","text":"hi"}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(event, InboundEvent::new("1", "u", "c", "hi"));

        assert!(parse_event("   ").unwrap().is_none());
        assert!(parse_event("{not json").is_err());
        assert!(parse_event(r#"{"event_id":"1"}"#).is_err());
    }

    #[tokio::test]
    async fn test_serves_events_and_cleans_up_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("bridge.sock");

        let chat = Arc::new(RecordingChat::default());
        let dispatcher = Arc::new(
            Dispatcher::new(Arc::new(ConversationStore::new("seed", 4)), chat.clone())
                .with_route("c1", Route::session(Arc::new(Upper))),
        );
        let server = Arc::new(EventServer::new(socket_path.clone(), dispatcher.clone()));
        let shutdown = CancellationToken::new();

        let running = {
            let server = Arc::clone(&server);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server.run(shutdown).await })
        };

        // Wait for the listener
        let mut client = None;
        for _ in 0..100 {
            if let Ok(stream) = UnixStream::connect(&socket_path).await {
                client = Some(stream);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let mut client = client.expect("server should accept connections");

        client
            .write_all(
                b"garbage\n{\"event_id\":\"1\",\"author_id\":\"u\",\"channel_id\":\"c1\",\"text\":\"hello\"}\n",
            )
            .await
            .unwrap();

        for _ in 0..100 {
            if !chat.sent.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*chat.sent.lock(), vec!["HELLO".to_string()]);
        assert_eq!(dispatcher.store().history("c1").await.unwrap().len(), 3);

        shutdown.cancel();
        running.await.unwrap().unwrap();
        assert!(!socket_path.exists());
    }
}
