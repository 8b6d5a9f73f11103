//! Status socket
//!
//! Provides a Unix domain socket the CLI and external tools use to ask the
//! running daemon what it sees. One JSON line in, one JSON line out.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::unistd::getuid;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::observer::{DaemonStatus, SharedStatus};

/// File name of the socket inside `$XDG_RUNTIME_DIR`
pub const SOCKET_NAME: &str = "stws-presence.sock";

// ============================================================================
// IPC Message Types
// ============================================================================

/// Request messages sent from CLI/external tools to the daemon
///
/// Serialized as JSON with a `type` field for discrimination:
/// - `{"type": "status"}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    /// Query connection status and the current session
    Status,
}

/// Response messages sent from the daemon back to CLI/external tools
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    /// Current daemon status, fields inlined next to `type`
    Status(DaemonStatus),
    /// Error occurred while processing request
    Error {
        /// Error description
        message: String,
    },
}

/// Answer a request from the shared status
pub fn respond(request: IpcRequest, status: &SharedStatus) -> IpcResponse {
    match request {
        IpcRequest::Status => IpcResponse::Status(status.get()),
    }
}

// ============================================================================
// IPC Server
// ============================================================================

/// Determine the socket path based on environment
///
/// Prefers `$XDG_RUNTIME_DIR/stws-presence.sock` if the environment variable
/// is set, otherwise falls back to `/tmp/stws-presence-$UID.sock`.
pub fn default_socket_path() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(runtime_dir) if !runtime_dir.is_empty() => PathBuf::from(runtime_dir).join(SOCKET_NAME),
        _ => {
            tracing::warn!("XDG_RUNTIME_DIR not set, using fallback socket path in /tmp");
            PathBuf::from(format!("/tmp/stws-presence-{}.sock", getuid()))
        }
    }
}

/// IPC server for status queries via Unix domain socket
///
/// The socket file is automatically removed when the server is dropped.
pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl IpcServer {
    /// Create the server at the default socket path
    ///
    /// # Errors
    ///
    /// Returns an error if a stale socket file cannot be removed or the
    /// socket cannot be bound.
    pub fn new() -> Result<Self> {
        Self::bind(default_socket_path())
    }

    /// Create the server at `socket_path`, replacing a stale socket file
    pub fn bind(socket_path: PathBuf) -> Result<Self> {
        tracing::info!(path = %socket_path.display(), "IPC socket path");

        // Stale from a previous run
        if socket_path.exists() {
            tracing::debug!(path = %socket_path.display(), "Removing stale socket file");
            std::fs::remove_file(&socket_path).with_context(|| {
                format!("Failed to remove stale socket file: {}", socket_path.display())
            })?;
        }

        let listener = UnixListener::bind(&socket_path).with_context(|| {
            format!("Failed to create IPC socket at {}", socket_path.display())
        })?;

        tracing::info!(path = %socket_path.display(), "IPC server listening");

        Ok(Self {
            listener,
            socket_path,
        })
    }

    /// Accept an incoming connection
    ///
    /// # Errors
    ///
    /// Returns an error if accepting the connection fails.
    pub async fn accept(&self) -> Result<UnixStream> {
        let (stream, _addr) = self
            .listener
            .accept()
            .await
            .context("Failed to accept IPC connection")?;

        tracing::debug!("Accepted IPC connection");

        Ok(stream)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Answer status requests until the task is dropped
    ///
    /// Each connection is served on its own task; a failing client only
    /// ends its own connection.
    pub async fn serve(self, status: SharedStatus) {
        loop {
            let stream = match self.accept().await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(error = %e, "IPC accept failed");
                    continue;
                }
            };

            let status = status.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    handle_ipc_connection(stream, |request| respond(request, &status)).await
                {
                    tracing::debug!(error = %e, "IPC connection ended with error");
                }
            });
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                tracing::warn!(error = %e, "Failed to remove IPC socket file on shutdown");
            } else {
                tracing::debug!(path = %self.socket_path.display(), "Removed IPC socket file");
            }
        }
    }
}

// ============================================================================
// IPC Connection Handler
// ============================================================================

/// Handle an incoming IPC connection.
///
/// This function:
/// 1. Reads a line of JSON from the stream
/// 2. Parses it as an `IpcRequest`
/// 3. Executes the request via the provided handler
/// 4. Sends the `IpcResponse` back as JSON
///
/// A line that does not parse is answered with `IpcResponse::Error`.
///
/// # Errors
///
/// Returns an error if reading from or writing to the stream fails.
pub async fn handle_ipc_connection<F>(mut stream: UnixStream, handler: F) -> Result<()>
where
    F: FnOnce(IpcRequest) -> IpcResponse,
{
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);

    let mut line = String::new();
    let bytes_read = reader
        .read_line(&mut line)
        .await
        .context("Failed to read IPC request")?;

    if bytes_read == 0 {
        tracing::debug!("IPC connection closed without data");
        return Ok(());
    }

    let line = line.trim();
    tracing::debug!(request = line, "Received IPC request");

    let response = match serde_json::from_str::<IpcRequest>(line) {
        Ok(request) => handler(request),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to parse IPC request");
            IpcResponse::Error {
                message: format!("Invalid request: {}", e),
            }
        }
    };

    let mut response_json =
        serde_json::to_string(&response).context("Failed to serialize IPC response")?;
    response_json.push('\n');

    writer
        .write_all(response_json.as_bytes())
        .await
        .context("Failed to write IPC response")?;
    writer.flush().await.context("Failed to flush IPC response")?;

    Ok(())
}
