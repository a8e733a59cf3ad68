use crate::process::restart::RestartPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How many instances a spec asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceCount {
    Fixed(u32),
    /// One instance per available CPU
    Auto,
}

impl InstanceCount {
    /// Concrete instance count on this host
    pub fn resolve(&self) -> usize {
        match *self {
            InstanceCount::Fixed(n) => n as usize,
            InstanceCount::Auto => cpu_parallelism(),
        }
    }
}

impl fmt::Display for InstanceCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceCount::Fixed(n) => write!(f, "{}", n),
            InstanceCount::Auto => write!(f, "max"),
        }
    }
}

/// Available CPU parallelism, falling back to 1 when it cannot be determined
pub fn cpu_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecMode {
    /// Exactly one forked process
    Single,
    /// Several interchangeable workers
    Clustered,
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecMode::Single => write!(f, "fork"),
            ExecMode::Clustered => write!(f, "cluster"),
        }
    }
}

/// Where an app's output goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    /// Interleave every cluster instance into the same files
    pub merge: bool,
    /// Moment-style timestamp format, e.g. `YYYY-MM-DD HH:mm:ss Z`
    pub timestamp_format: Option<String>,
}

impl LogPaths {
    /// Default `<log_dir>/<name>-out.log` and `<log_dir>/<name>-error.log`
    pub fn in_dir(log_dir: &Path, name: &str) -> Self {
        Self {
            stdout: log_dir.join(format!("{}-out.log", name)),
            stderr: log_dir.join(format!("{}-error.log", name)),
            merge: false,
            timestamp_format: None,
        }
    }
}

/// Validated, immutable description of one supervised application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub name: String,
    pub command: PathBuf,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub instances: InstanceCount,
    pub exec_mode: ExecMode,
    pub environment: BTreeMap<String, String>,
    pub logs: LogPaths,
    pub auto_restart: bool,
    /// Accepted for compatibility, file watching is not implemented
    pub watch: bool,
    pub memory_ceiling_bytes: Option<u64>,
    pub restart_policy: RestartPolicy,
    /// Grace period between SIGTERM and SIGKILL
    pub kill_timeout: Duration,
}

impl ProcessSpec {
    /// Minimal spec with defaults, mostly useful for embedding and tests
    pub fn new(name: impl Into<String>, command: impl Into<PathBuf>, log_dir: &Path) -> Self {
        let name = name.into();
        Self {
            logs: LogPaths::in_dir(log_dir, &name),
            name,
            command: command.into(),
            args: Vec::new(),
            working_directory: None,
            instances: InstanceCount::Fixed(1),
            exec_mode: ExecMode::Single,
            environment: BTreeMap::new(),
            auto_restart: true,
            watch: false,
            memory_ceiling_bytes: None,
            restart_policy: RestartPolicy::new(),
            kill_timeout: Duration::from_millis(1600),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn clustered(mut self, instances: InstanceCount) -> Self {
        self.exec_mode = ExecMode::Clustered;
        self.instances = instances;
        self
    }

    /// Number of instances this spec runs on this host
    pub fn instance_count(&self) -> usize {
        match self.exec_mode {
            ExecMode::Single => 1,
            ExecMode::Clustered => self.instances.resolve(),
        }
    }

    pub fn is_clustered(&self) -> bool {
        self.exec_mode == ExecMode::Clustered
    }

    /// The restart policy with `auto_restart` applied
    pub fn effective_restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            enabled: self.auto_restart && self.restart_policy.enabled,
            ..self.restart_policy.clone()
        }
    }
}
