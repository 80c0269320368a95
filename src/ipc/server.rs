//! IPC Server - Unix socket server for control clients
//!
//! Handles incoming connections from the CLI or the application's update UI
//! and dispatches commands to the worker as message events.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::ipc::protocol::{
    parse_command, serialize_response, Command, ErrorInfo, Response, PROTOCOL_VERSION,
};
use crate::origin::OriginClient;
use crate::worker::{Message, ServiceWorker};

/// IPC Server that listens for control commands
pub struct IpcServer {
    /// Worker receiving message events
    worker: Arc<ServiceWorker>,
    /// Origin client, queried for health and recent errors
    origin: Arc<OriginClient>,
    /// Socket file location
    socket_path: PathBuf,
    /// Socket listener
    listener: Option<UnixListener>,
    /// Active connections counter
    connection_count: Arc<RwLock<u32>>,
}

impl IpcServer {
    /// Create a new IPC server
    pub fn new(
        worker: Arc<ServiceWorker>,
        origin: Arc<OriginClient>,
        socket_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            worker,
            origin,
            socket_path: socket_path.into(),
            listener: None,
            connection_count: Arc::new(RwLock::new(0)),
        }
    }

    /// Start the IPC server
    pub async fn start(&mut self) -> Result<()> {
        // Clean up any existing socket file
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .context("Failed to remove existing socket file")?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind Unix socket {}", self.socket_path.display()))?;

        info!(socket_path = %self.socket_path.display(), "IPC server started");

        self.listener = Some(listener);
        Ok(())
    }

    /// Run the server loop, accepting connections
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("Server not started")?;

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let worker = Arc::clone(&self.worker);
                    let origin = Arc::clone(&self.origin);
                    let connection_count = Arc::clone(&self.connection_count);

                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(stream, worker, origin, connection_count).await
                        {
                            error!(error = %e, "Connection handler error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Stop the IPC server and clean up
    pub fn stop(&self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).context("Failed to remove socket file")?;
        }
        info!("IPC server stopped");
        Ok(())
    }
}

/// Handle a single client connection
async fn handle_connection(
    stream: UnixStream,
    worker: Arc<ServiceWorker>,
    origin: Arc<OriginClient>,
    connection_count: Arc<RwLock<u32>>,
) -> Result<()> {
    {
        let mut count = connection_count.write().await;
        *count += 1;
        debug!(count = *count, "New connection");
    }

    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();

    // Newline-delimited JSON, one response per command
    loop {
        line.clear();
        match buf_reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("Connection closed by client");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                debug!(command = %trimmed, "Received command");

                let response = match parse_command(trimmed.as_bytes()) {
                    Ok(command) => process_command(command, &worker, &origin).await,
                    Err(e) => {
                        error!(error = %e, command = %trimmed, "Failed to parse command");
                        Response::Error {
                            error: format!("Invalid command: {}", e),
                        }
                    }
                };

                match serialize_response(&response) {
                    Ok(json) => {
                        if let Err(e) = writer.write_all(&json).await {
                            error!(error = %e, "Failed to write response");
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to serialize response");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to read from socket");
                break;
            }
        }
    }

    {
        let mut count = connection_count.write().await;
        *count = count.saturating_sub(1);
        debug!(count = *count, "Connection ended");
    }

    Ok(())
}

/// Process a command and return a response
async fn process_command(
    command: Command,
    worker: &ServiceWorker,
    origin: &OriginClient,
) -> Response {
    match command {
        Command::SkipWaiting => {
            info!("Processing skipWaiting command");
            match worker.on_message(Message::SkipWaiting).await {
                Ok(message) => Response::Success {
                    message: Some(message),
                },
                Err(e) => Response::Error {
                    error: format!("Activation failed: {:#}", e),
                },
            }
        }

        Command::DownloadOffline => {
            info!("Processing downloadOffline command");
            match worker.on_message(Message::DownloadOffline).await {
                Ok(message) => Response::Success {
                    message: Some(message),
                },
                Err(e) => Response::Error {
                    error: format!("Offline sync failed: {:#}", e),
                },
            }
        }

        Command::GetStatus => {
            debug!("Processing getStatus command");

            let status = worker.status().await;
            let recent_errors = origin
                .recent_errors()
                .into_iter()
                .map(|e| ErrorInfo {
                    timestamp: e.timestamp,
                    method: e.method,
                    path: e.path,
                    error: e.error,
                })
                .collect();

            Response::Status {
                version: PROTOCOL_VERSION,
                state: status.state.as_str().to_string(),
                active: status.active,
                origin: origin.origin().to_string(),
                health: origin.health_status().to_string(),
                manifest_entries: status.manifest_entries,
                live_entries: status.live_entries,
                hits: status.hits,
                misses: status.misses,
                recent_errors,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStorage;
    use crate::ipc::client::send_command;
    use crate::manifest::ResourceManifest;
    use crate::worker::testing::StubFetcher;
    use crate::worker::WorkerOptions;
    use tempfile::TempDir;

    async fn serve(dir: &TempDir, wait_for_skip: bool) -> PathBuf {
        let fetcher = Arc::new(StubFetcher::new());
        fetcher.respond("/index.html", 200, "<html>");
        fetcher.respond("/main.dart.js", 200, "main");
        let manifest: ResourceManifest = [("index.html", "i"), ("main.dart.js", "m")]
            .into_iter()
            .collect();
        let options = WorkerOptions {
            origin: "http://127.0.0.1:9".to_string(),
            shell: vec!["index.html".to_string()],
            wait_for_skip,
        };
        let worker = Arc::new(
            ServiceWorker::new(manifest, options, Arc::new(MemoryStorage::new()), fetcher).unwrap(),
        );
        worker.start().await.unwrap();
        let origin = Arc::new(OriginClient::new("http://127.0.0.1:9").unwrap());

        let socket_path = dir.path().join("shellcache.sock");
        let mut server = IpcServer::new(worker, origin, &socket_path);
        server.start().await.unwrap();
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        socket_path
    }

    #[tokio::test]
    async fn test_get_status_reports_worker_state() {
        let dir = TempDir::new().unwrap();
        let socket_path = serve(&dir, true).await;

        match send_command(&socket_path, &Command::GetStatus).await.unwrap() {
            Response::Status {
                state,
                active,
                health,
                manifest_entries,
                ..
            } => {
                assert_eq!(state, "staged");
                assert!(!active);
                assert_eq!(health, "healthy");
                assert_eq!(manifest_entries, 2);
            }
            other => panic!("Expected Status, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_skip_waiting_activates() {
        let dir = TempDir::new().unwrap();
        let socket_path = serve(&dir, true).await;

        match send_command(&socket_path, &Command::SkipWaiting).await.unwrap() {
            Response::Success { message } => {
                assert!(message.unwrap().contains("Bootstrapped"));
            }
            other => panic!("Expected Success, got {:?}", other),
        }

        match send_command(&socket_path, &Command::GetStatus).await.unwrap() {
            Response::Status { state, active, .. } => {
                assert_eq!(state, "committed");
                assert!(active);
            }
            other => panic!("Expected Status, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_download_offline_caches_whole_manifest() {
        let dir = TempDir::new().unwrap();
        let socket_path = serve(&dir, false).await;

        match send_command(&socket_path, &Command::DownloadOffline).await.unwrap() {
            Response::Success { message } => {
                assert_eq!(message.as_deref(), Some("Offline sync started"));
            }
            other => panic!("Expected Success, got {:?}", other),
        }

        for _ in 0..200 {
            match send_command(&socket_path, &Command::GetStatus).await.unwrap() {
                Response::Status {
                    live_entries,
                    manifest_entries,
                    ..
                } if live_entries == manifest_entries => return,
                Response::Status { .. } => {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await
                }
                other => panic!("Expected Status, got {:?}", other),
            }
        }
        panic!("offline sync never filled the live region");
    }

    #[tokio::test]
    async fn test_invalid_command_gets_error_response() {
        let dir = TempDir::new().unwrap();
        let socket_path = serve(&dir, false).await;

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        writer.write_all(b"{\"type\":\"mount\"}\n").await.unwrap();

        let mut line = String::new();
        BufReader::new(reader).read_line(&mut line).await.unwrap();
        assert!(line.contains("\"type\":\"error\""));
        assert!(line.contains("Invalid command"));
    }
}
