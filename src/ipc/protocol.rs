// IPC Protocol definitions for client-daemon communication

use crate::process::{InstanceSnapshot, ReloadReport, StartSummary};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// All available commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Start an app, one instance (`name#n`) or everything when `target` is `None`
    Start { target: Option<String> },
    Stop { target: Option<String>, force: bool },
    Restart { target: Option<String> },
    /// Re-read an ecosystem file and reconcile
    Reload { config_path: PathBuf },
    Status,
    Ping,
    /// Stop every instance and exit the daemon
    Shutdown,
}

/// Serializable form of a start summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartReport {
    pub started: Vec<String>,
    pub already_running: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl From<StartSummary> for StartReport {
    fn from(summary: StartSummary) -> Self {
        Self {
            started: summary.started.iter().map(ToString::to_string).collect(),
            already_running: summary
                .already_running
                .iter()
                .map(ToString::to_string)
                .collect(),
            failed: summary
                .failed
                .into_iter()
                .map(|(id, error)| (id.to_string(), error))
                .collect(),
        }
    }
}

/// Response data variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseData {
    Started(StartReport),
    Stopped {
        instances: Vec<String>,
        #[serde(default)]
        failed: Vec<(String, String)>,
    },
    Restarted { instances: Vec<String> },
    Reloaded(ReloadReport),
    Status(Vec<InstanceSnapshot>),
    Pong {
        version: String,
        pid: u32,
        uptime_secs: u64,
    },
    ShuttingDown,
}

/// Request message from client to daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub command: Command,
}

/// Response message from daemon to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: Result<ResponseData, String>,
}

impl Request {
    pub fn new(id: u64, command: Command) -> Self {
        Self { id, command }
    }
}

impl Response {
    pub fn success(id: u64, data: ResponseData) -> Self {
        Self {
            id,
            result: Ok(data),
        }
    }

    pub fn error(id: u64, error: String) -> Self {
        Self {
            id,
            result: Err(error),
        }
    }
}
