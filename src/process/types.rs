use crate::process::restart::RestartTracker;
use crate::registry::{ExecMode, ProcessSpec};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Identity of one instance: spec name plus ordinal, rendered `name#ordinal`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId {
    pub name: String,
    pub ordinal: u32,
}

impl InstanceId {
    pub fn new(name: impl Into<String>, ordinal: u32) -> Self {
        Self {
            name: name.into(),
            ordinal,
        }
    }

    /// Parse `name#ordinal`, returning `None` for anything else
    pub fn parse(text: &str) -> Option<Self> {
        let (name, ordinal) = text.rsplit_once('#')?;
        if name.is_empty() {
            return None;
        }
        Some(Self::new(name, ordinal.parse().ok()?))
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.ordinal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceState::Starting => write!(f, "starting"),
            InstanceState::Running => write!(f, "running"),
            InstanceState::Stopping => write!(f, "stopping"),
            InstanceState::Stopped => write!(f, "stopped"),
            InstanceState::Crashed => write!(f, "crashed"),
        }
    }
}

/// Why an instance stopped running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitCause {
    Exited(i32),
    Signaled(i32),
    /// Terminated by the resource monitor
    MemoryLimitExceeded,
    /// The command could not be started at all
    LaunchFailed,
}

impl fmt::Display for ExitCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitCause::Exited(code) => write!(f, "exit code {}", code),
            ExitCause::Signaled(signal) => write!(f, "signal {}", signal),
            ExitCause::MemoryLimitExceeded => write!(f, "memory limit exceeded"),
            ExitCause::LaunchFailed => write!(f, "launch failed"),
        }
    }
}

/// What the OS reported when a child was reaped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    /// Outcome used when waiting on the child itself failed
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn cause(&self) -> ExitCause {
        match (self.signal, self.code) {
            (Some(signal), _) => ExitCause::Signaled(signal),
            (None, Some(code)) => ExitCause::Exited(code),
            (None, None) => ExitCause::Exited(-1),
        }
    }
}

/// Sent by an exit watcher when its child terminates
#[derive(Debug, Clone)]
pub struct ExitEvent {
    pub id: InstanceId,
    /// Spawn generation the watcher belongs to, older generations are stale
    pub generation: u64,
    pub outcome: ExitOutcome,
}

/// Mutable state of one instance, always accessed under its row lock
#[derive(Debug)]
pub struct Instance {
    pub id: InstanceId,
    /// Snapshot of the spec generation that spawned this instance
    pub spec: Arc<ProcessSpec>,
    pub cluster_size: usize,
    pub state: InstanceState,
    pub pid: Option<u32>,
    pub spawn_generation: u64,
    pub started_at: Option<Instant>,
    pub started_wall: Option<SystemTime>,
    pub restart_count: u32,
    pub last_exit_code: Option<i32>,
    pub last_exit_cause: Option<ExitCause>,
    pub last_error: Option<String>,
    pub memory_usage: u64,
    pub cpu_usage: f32,
    pub tracker: RestartTracker,
    pub pending_restart: Option<JoinHandle<()>>,
    pub stop_requested: bool,
    /// Cause to report for the next exit instead of the raw status
    pub pending_cause: Option<ExitCause>,
    pub exit_rx: Option<watch::Receiver<Option<ExitOutcome>>>,
    pub exit_handled: bool,
    /// Crash loop detected, nothing restarts it until an operator start
    pub gave_up: bool,
}

impl Instance {
    pub fn new(id: InstanceId, spec: Arc<ProcessSpec>, cluster_size: usize) -> Self {
        Self {
            id,
            spec,
            cluster_size,
            state: InstanceState::Starting,
            pid: None,
            spawn_generation: 0,
            started_at: None,
            started_wall: None,
            restart_count: 0,
            last_exit_code: None,
            last_exit_cause: None,
            last_error: None,
            memory_usage: 0,
            cpu_usage: 0.0,
            tracker: RestartTracker::new(),
            pending_restart: None,
            stop_requested: false,
            pending_cause: None,
            exit_rx: None,
            exit_handled: true,
            gave_up: false,
        }
    }

    /// True until the first launch attempt
    pub fn never_launched(&self) -> bool {
        self.spawn_generation == 0
    }

    pub fn uptime(&self) -> Duration {
        self.started_at
            .map(|started| started.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    pub fn cancel_pending_restart(&mut self) -> bool {
        match self.pending_restart.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            name: self.spec.name.clone(),
            instance_id: self.id.to_string(),
            ordinal: self.id.ordinal,
            mode: self.spec.exec_mode,
            state: self.state,
            pid: self.pid,
            uptime_secs: self.started_at.map(|started| started.elapsed().as_secs()),
            started_at: self.started_wall,
            restart_count: self.restart_count,
            memory_usage: self.memory_usage,
            cpu_usage: self.cpu_usage,
            last_exit_code: self.last_exit_code,
            last_exit_cause: self.last_exit_cause,
            last_error: self.last_error.clone(),
            restart_pending: self.pending_restart.is_some(),
            gave_up: self.gave_up,
        }
    }
}

/// Point-in-time view of an instance, as reported by `status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub name: String,
    pub instance_id: String,
    pub ordinal: u32,
    pub mode: ExecMode,
    pub state: InstanceState,
    pub pid: Option<u32>,
    pub uptime_secs: Option<u64>,
    pub started_at: Option<SystemTime>,
    pub restart_count: u32,
    pub memory_usage: u64,
    pub cpu_usage: f32,
    pub last_exit_code: Option<i32>,
    pub last_exit_cause: Option<ExitCause>,
    pub last_error: Option<String>,
    pub restart_pending: bool,
    pub gave_up: bool,
}

/// Lifecycle notifications broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SupervisorEvent {
    Started { id: InstanceId, pid: u32 },
    LaunchFailed { id: InstanceId, error: String },
    Exited { id: InstanceId, cause: ExitCause },
    Stopped { id: InstanceId },
    RestartScheduled { id: InstanceId, delay: Duration },
    /// Too many exits inside the window, the instance stays crashed
    CrashLoop { id: InstanceId, exits: usize },
    MemoryLimitExceeded { id: InstanceId, usage: u64, limit: u64 },
    Reloaded { generation: u64 },
}
