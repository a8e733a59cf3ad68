// IPC Client - Communicates with the daemon via Unix socket

use crate::config::DEFAULT_SOCKET_PATH;
use crate::error::{CorralError, Result};
use crate::ipc::{Command, Request, Response, ResponseData};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Maximum number of connection attempts
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Delay between connection attempts
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Blocking client for the daemon's control socket
pub struct IpcClient {
    socket_path: PathBuf,
    request_id: AtomicU64,
}

impl IpcClient {
    pub fn new() -> Self {
        Self::with_socket_path(DEFAULT_SOCKET_PATH)
    }

    pub fn with_socket_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            socket_path: path.as_ref().to_path_buf(),
            request_id: AtomicU64::new(1),
        }
    }

    /// Send a command and return the daemon's answer, turning a daemon-side error into `Err`
    pub fn call(&self, command: Command) -> Result<ResponseData> {
        self.send_command(command)?
            .result
            .map_err(CorralError::Ipc)
    }

    /// Send a command to the daemon and wait for a response.
    ///
    /// Only connecting is retried; once the request is written it is never sent twice.
    pub fn send_command(&self, command: Command) -> Result<Response> {
        let request_id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = Request::new(request_id, command);

        let stream = self.connect_with_retry()?;
        let response = Self::exchange(stream, &request)?;

        if response.id != request_id {
            return Err(CorralError::Protocol(format!(
                "Response ID mismatch: expected {}, got {}",
                request_id, response.id
            )));
        }
        Ok(response)
    }

    fn exchange(mut stream: UnixStream, request: &Request) -> Result<Response> {
        let request_json = serde_json::to_string(request).map_err(|e| {
            CorralError::Serialization(format!("Failed to serialize request: {}", e))
        })?;

        writeln!(stream, "{}", request_json)
            .map_err(|e| CorralError::Ipc(format!("Failed to write request: {}", e)))?;
        stream
            .flush()
            .map_err(|e| CorralError::Ipc(format!("Failed to flush stream: {}", e)))?;

        let mut reader = BufReader::new(stream);
        let mut response_line = String::new();
        let read = reader
            .read_line(&mut response_line)
            .map_err(|e| CorralError::Ipc(format!("Failed to read response: {}", e)))?;
        if read == 0 {
            return Err(CorralError::Connection(
                "Daemon closed the connection without answering".to_string(),
            ));
        }

        serde_json::from_str(&response_line).map_err(|e| {
            CorralError::Deserialization(format!("Failed to deserialize response: {}", e))
        })
    }

    fn connect_with_retry(&self) -> Result<UnixStream> {
        let mut last_error = None;
        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            match self.connect() {
                Ok(stream) => return Ok(stream),
                Err(CorralError::DaemonNotRunning) => return Err(CorralError::DaemonNotRunning),
                Err(e) => {
                    last_error = Some(e);
                    if attempt < MAX_RETRY_ATTEMPTS {
                        std::thread::sleep(RETRY_DELAY);
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            CorralError::Connection("Failed to connect after retries".to_string())
        }))
    }

    fn connect(&self) -> Result<UnixStream> {
        if !self.socket_path.exists() {
            return Err(CorralError::DaemonNotRunning);
        }

        UnixStream::connect(&self.socket_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused
                || e.kind() == std::io::ErrorKind::NotFound
            {
                CorralError::DaemonNotRunning
            } else {
                CorralError::Connection(format!("Failed to connect to daemon: {}", e))
            }
        })
    }

    /// True when something answers a ping on the socket
    pub fn is_daemon_running(&self) -> bool {
        matches!(self.call(Command::Ping), Ok(ResponseData::Pong { .. }))
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Default for IpcClient {
    fn default() -> Self {
        Self::new()
    }
}
