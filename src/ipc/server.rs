// IPC Server - Listens for client connections and handles requests

use crate::error::{CorralError, Result};
use crate::ipc::{Command, Request, Response, ResponseData};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

/// IPC server for handling client connections
pub struct IpcServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
}

impl IpcServer {
    pub fn with_socket_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            socket_path: path.as_ref().to_path_buf(),
            listener: None,
        }
    }

    /// Bind the Unix socket, replacing a stale socket file left by a dead daemon
    pub async fn start(&mut self) -> Result<()> {
        if self.socket_path.exists() {
            if UnixStream::connect(&self.socket_path).await.is_ok() {
                return Err(CorralError::Ipc(format!(
                    "Another daemon is already listening on {}",
                    self.socket_path.display()
                )));
            }
            std::fs::remove_file(&self.socket_path).map_err(|e| {
                CorralError::Ipc(format!("Failed to remove stale socket: {}", e))
            })?;
        }

        if let Some(parent) = self.socket_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CorralError::Ipc(format!("Failed to create socket directory: {}", e))
                })?;
            }
        }

        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| CorralError::Ipc(format!("Failed to bind to socket: {}", e)))?;

        // Owner only
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.socket_path, permissions).map_err(|e| {
                CorralError::Ipc(format!("Failed to set socket permissions: {}", e))
            })?;
        }

        tracing::info!(socket = %self.socket_path.display(), "Listening for commands");
        self.listener = Some(listener);
        Ok(())
    }

    /// Accept connections forever, answering every request line with `handler`
    pub async fn run<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(Command) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResponseData>> + Send,
    {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| CorralError::Ipc("Server not started".to_string()))?;
        let handler = Arc::new(handler);

        loop {
            let stream = match listener.accept().await {
                Ok((stream, _addr)) => stream,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            };

            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, handler.as_ref()).await {
                    tracing::debug!(error = %e, "Connection closed with error");
                }
            });
        }
    }

    /// Remove the socket file
    pub fn stop(&mut self) -> Result<()> {
        self.listener = None;

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| {
                CorralError::Ipc(format!("Failed to remove socket file: {}", e))
            })?;
        }

        Ok(())
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if self.listener.is_some() {
            let _ = self.stop();
        }
    }
}

async fn serve_connection<F, Fut>(stream: UnixStream, handler: &F) -> Result<()>
where
    F: Fn(Command) -> Fut,
    Fut: Future<Output = Result<ResponseData>>,
{
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| CorralError::Ipc(format!("Failed to read request: {}", e)))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                tracing::debug!(id = request.id, command = ?request.command, "Request");
                match handler(request.command).await {
                    Ok(data) => Response::success(request.id, data),
                    Err(e) => Response::error(request.id, e.to_string()),
                }
            }
            Err(e) => Response::error(0, format!("Malformed request: {}", e)),
        };

        let mut json = serde_json::to_string(&response).map_err(|e| {
            CorralError::Serialization(format!("Failed to serialize response: {}", e))
        })?;
        json.push('\n');

        write_half
            .write_all(json.as_bytes())
            .await
            .map_err(|e| CorralError::Ipc(format!("Failed to write response: {}", e)))?;
        write_half
            .flush()
            .await
            .map_err(|e| CorralError::Ipc(format!("Failed to flush stream: {}", e)))?;
    }

    Ok(())
}
