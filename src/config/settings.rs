use crate::config::SpecDefaults;
use crate::error::{CorralError, Result};
use crate::logs::DEFAULT_MAX_LOG_SIZE;
use crate::process::monitor::DEFAULT_SAMPLE_INTERVAL_MS;
use crate::process::restart::{
    BackoffStrategy, RestartPolicy, DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MAX_RESTARTS,
    DEFAULT_STABLE_AFTER, DEFAULT_WINDOW,
};
use crate::process::SupervisorOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/corral.sock";
pub const DEFAULT_LOG_DIR: &str = "/tmp/corral/logs";
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 1600;

/// Daemon-wide settings, read from an optional TOML file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorSettings {
    pub socket_path: PathBuf,
    pub log_dir: PathBuf,
    pub grace_period_ms: u64,
    pub sample_interval_ms: u64,
    /// Rotate log files at this size, 0 disables rotation
    pub log_max_bytes: u64,
    pub restart: RestartDefaults,
}

/// Restart policy used by apps that do not override it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RestartDefaults {
    pub max_restarts: usize,
    pub window_secs: u64,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub stable_after_ms: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            sample_interval_ms: DEFAULT_SAMPLE_INTERVAL_MS,
            log_max_bytes: DEFAULT_MAX_LOG_SIZE,
            restart: RestartDefaults::default(),
        }
    }
}

impl Default for RestartDefaults {
    fn default() -> Self {
        Self {
            max_restarts: DEFAULT_MAX_RESTARTS,
            window_secs: DEFAULT_WINDOW.as_secs(),
            initial_delay_ms: DEFAULT_INITIAL_DELAY.as_millis() as u64,
            max_delay_ms: DEFAULT_MAX_DELAY.as_millis() as u64,
            stable_after_ms: DEFAULT_STABLE_AFTER.as_millis() as u64,
        }
    }
}

impl SupervisorSettings {
    /// Settings from `path`, or the defaults when no file is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CorralError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let settings: SupervisorSettings = toml::from_str(contents)
            .map_err(|e| CorralError::InvalidConfig(format!("Failed to parse settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_interval_ms == 0 {
            return Err(CorralError::InvalidConfig(
                "sample_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.grace_period_ms == 0 {
            return Err(CorralError::InvalidConfig(
                "grace_period_ms must be greater than zero".to_string(),
            ));
        }
        if self.restart.max_restarts == 0 {
            return Err(CorralError::InvalidConfig(
                "restart.max_restarts must be at least 1".to_string(),
            ));
        }
        if self.restart.window_secs == 0 {
            return Err(CorralError::InvalidConfig(
                "restart.window_secs must be greater than zero".to_string(),
            ));
        }
        if self.restart.initial_delay_ms > self.restart.max_delay_ms {
            return Err(CorralError::InvalidConfig(
                "restart.initial_delay_ms must not exceed restart.max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            enabled: true,
            max_restarts: self.restart.max_restarts,
            window: Duration::from_secs(self.restart.window_secs),
            backoff: BackoffStrategy::Exponential {
                initial: Duration::from_millis(self.restart.initial_delay_ms),
                max: Duration::from_millis(self.restart.max_delay_ms),
            },
            stable_after: Duration::from_millis(self.restart.stable_after_ms),
        }
    }

    pub fn spec_defaults(&self) -> SpecDefaults {
        SpecDefaults {
            log_dir: self.log_dir.clone(),
            kill_timeout: Duration::from_millis(self.grace_period_ms),
            restart: self.restart_policy(),
        }
    }

    pub fn supervisor_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            sample_interval: Duration::from_millis(self.sample_interval_ms),
            log_max_bytes: self.log_max_bytes,
        }
    }
}
