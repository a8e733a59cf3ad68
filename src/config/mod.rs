// Config module - Ecosystem file decoding and daemon settings

mod settings;

pub use settings::{
    RestartDefaults, SupervisorSettings, DEFAULT_GRACE_PERIOD_MS, DEFAULT_LOG_DIR,
    DEFAULT_SOCKET_PATH,
};

use crate::error::{CorralError, Result};
use crate::process::restart::{BackoffStrategy, RestartPolicy};
use crate::registry::{ExecMode, InstanceCount, LogPaths, ProcessSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Only schema version understood by this build
pub const ECOSYSTEM_VERSION: u32 = 1;

/// Top level of an ecosystem file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EcosystemFile {
    pub version: u32,
    #[serde(default)]
    pub apps: Vec<AppConfig>,
}

/// `args` as a single whitespace separated string or a list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgsValue {
    Line(String),
    List(Vec<String>),
}

/// `instances` as a number or `"max"`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstancesValue {
    Count(i64),
    Keyword(String),
}

/// Environment values are rendered to strings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Flag(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl EnvValue {
    fn render(&self) -> String {
        match self {
            EnvValue::Flag(b) => b.to_string(),
            EnvValue::Integer(n) => n.to_string(),
            EnvValue::Float(x) => x.to_string(),
            EnvValue::Text(s) => s.clone(),
        }
    }
}

/// `max_memory_restart` as plain bytes or a size string like `"512M"`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MemoryValue {
    Bytes(u64),
    Text(String),
}

/// One app entry, using the usual ecosystem field names
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub name: String,

    /// Executable, resolved through `PATH` when it has no slash
    pub script: String,

    #[serde(default)]
    pub args: Option<ArgsValue>,

    #[serde(default)]
    pub cwd: Option<String>,

    #[serde(default)]
    pub instances: Option<InstancesValue>,

    /// `fork`/`fork_mode` or `cluster`/`cluster_mode`
    #[serde(default)]
    pub exec_mode: Option<String>,

    #[serde(default)]
    pub env: BTreeMap<String, EnvValue>,

    #[serde(default)]
    pub out_file: Option<String>,

    #[serde(default)]
    pub error_file: Option<String>,

    #[serde(default)]
    pub log_date_format: Option<String>,

    #[serde(default)]
    pub merge_logs: bool,

    #[serde(default = "default_autorestart")]
    pub autorestart: bool,

    #[serde(default)]
    pub watch: bool,

    #[serde(default)]
    pub max_memory_restart: Option<MemoryValue>,

    #[serde(default)]
    pub max_restarts: Option<usize>,

    /// Milliseconds of uptime after which the instance counts as stable
    #[serde(default)]
    pub min_uptime: Option<u64>,

    /// Fixed delay before restarting, in milliseconds
    #[serde(default)]
    pub restart_delay: Option<u64>,

    /// Initial exponential backoff delay, in milliseconds
    #[serde(default)]
    pub exp_backoff_restart_delay: Option<u64>,

    /// Grace period between SIGTERM and SIGKILL, in milliseconds
    #[serde(default)]
    pub kill_timeout: Option<u64>,
}

fn default_autorestart() -> bool {
    true
}

/// Values an app falls back to when its entry does not set them
#[derive(Debug, Clone)]
pub struct SpecDefaults {
    pub log_dir: PathBuf,
    pub kill_timeout: Duration,
    pub restart: RestartPolicy,
}

impl Default for SpecDefaults {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            kill_timeout: Duration::from_millis(DEFAULT_GRACE_PERIOD_MS),
            restart: RestartPolicy::new(),
        }
    }
}

impl EcosystemFile {
    /// Load an ecosystem file (supports TOML and JSON)
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CorralError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        match extension {
            "toml" => Self::parse_toml(&contents),
            "json" => Self::parse_json(&contents),
            _ => Err(CorralError::InvalidConfig(format!(
                "Unsupported file format: {}. Use .toml or .json",
                extension
            ))),
        }
    }

    pub fn parse_toml(contents: &str) -> Result<Self> {
        let file: EcosystemFile = toml::from_str(contents)
            .map_err(|e| CorralError::InvalidConfig(format!("Failed to parse TOML: {}", e)))?;
        file.check_version()
    }

    pub fn parse_json(contents: &str) -> Result<Self> {
        let file: EcosystemFile = serde_json::from_str(contents)
            .map_err(|e| CorralError::InvalidConfig(format!("Failed to parse JSON: {}", e)))?;
        file.check_version()
    }

    fn check_version(self) -> Result<Self> {
        if self.version != ECOSYSTEM_VERSION {
            return Err(CorralError::InvalidConfig(format!(
                "Unsupported ecosystem version {} (expected {})",
                self.version, ECOSYSTEM_VERSION
            )));
        }
        Ok(self)
    }

    /// Turn every app into a spec; relative paths resolve against `base_dir`
    pub fn into_specs(self, base_dir: &Path, defaults: &SpecDefaults) -> Result<Vec<ProcessSpec>> {
        self.apps
            .into_iter()
            .map(|app| app.into_spec(base_dir, defaults))
            .collect()
    }
}

/// Read an ecosystem file and convert it to specs ready for `Registry::load`
pub fn load_specs(path: &Path, defaults: &SpecDefaults) -> Result<Vec<ProcessSpec>> {
    let file = EcosystemFile::from_file(path)?;
    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    file.into_specs(&base_dir, defaults)
}

impl AppConfig {
    pub fn into_spec(self, base_dir: &Path, defaults: &SpecDefaults) -> Result<ProcessSpec> {
        let name = self.name.clone();
        let invalid = |reason: String| CorralError::InvalidConfig(format!("app '{}': {}", name, reason));

        let exec_mode = match self.exec_mode.as_deref() {
            None | Some("fork") | Some("fork_mode") => ExecMode::Single,
            Some("cluster") | Some("cluster_mode") => ExecMode::Clustered,
            Some(other) => return Err(invalid(format!("unknown exec_mode '{}'", other))),
        };

        let instances = match self.instances {
            None => InstanceCount::Fixed(1),
            Some(ref value) => parse_instances(value).map_err(invalid)?,
        };

        let cwd = self
            .cwd
            .as_deref()
            .map(|dir| resolve(base_dir, &expand_env(dir)));

        let script = expand_env(&self.script);
        let command = if script.contains('/') {
            resolve(cwd.as_deref().unwrap_or(base_dir), &script)
        } else {
            PathBuf::from(script)
        };

        let args = match &self.args {
            None => Vec::new(),
            Some(ArgsValue::Line(line)) => line.split_whitespace().map(expand_env).collect(),
            Some(ArgsValue::List(list)) => list.iter().map(|arg| expand_env(arg)).collect(),
        };

        let environment = self
            .env
            .iter()
            .map(|(key, value)| (key.clone(), expand_env(&value.render())))
            .collect();

        let mut logs = LogPaths::in_dir(&defaults.log_dir, &self.name);
        if let Some(ref out) = self.out_file {
            logs.stdout = resolve(base_dir, &expand_env(out));
        }
        if let Some(ref err) = self.error_file {
            logs.stderr = resolve(base_dir, &expand_env(err));
        }
        logs.merge = self.merge_logs;
        logs.timestamp_format = self.log_date_format.clone();

        let memory_ceiling_bytes = match &self.max_memory_restart {
            None => None,
            Some(MemoryValue::Bytes(n)) => Some(*n),
            Some(MemoryValue::Text(text)) => Some(parse_memory_size(text).map_err(invalid)?),
        };

        if self.watch {
            tracing::warn!(app = %self.name, "watch is not supported and will be ignored");
        }

        Ok(ProcessSpec {
            name: self.name.clone(),
            command,
            args,
            working_directory: cwd,
            instances,
            exec_mode,
            environment,
            logs,
            auto_restart: self.autorestart,
            watch: self.watch,
            memory_ceiling_bytes,
            restart_policy: self.restart_policy(&defaults.restart),
            kill_timeout: self
                .kill_timeout
                .map(Duration::from_millis)
                .unwrap_or(defaults.kill_timeout),
        })
    }

    fn restart_policy(&self, defaults: &RestartPolicy) -> RestartPolicy {
        let mut policy = defaults.clone();

        if let Some(max) = self.max_restarts {
            policy.max_restarts = max;
        }
        if let Some(ms) = self.min_uptime {
            policy.stable_after = Duration::from_millis(ms);
        }

        let default_max = match defaults.backoff {
            BackoffStrategy::Exponential { max, .. } => max,
            BackoffStrategy::Fixed { .. } => crate::process::restart::DEFAULT_MAX_DELAY,
        };

        // Exponential backoff wins when both delays are given
        if let Some(ms) = self.exp_backoff_restart_delay {
            policy.backoff = BackoffStrategy::Exponential {
                initial: Duration::from_millis(ms),
                max: default_max,
            };
        } else if let Some(ms) = self.restart_delay {
            policy.backoff = BackoffStrategy::Fixed {
                delay: Duration::from_millis(ms),
            };
        }

        policy
    }
}

fn resolve(base: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn parse_instances(value: &InstancesValue) -> std::result::Result<InstanceCount, String> {
    match value {
        InstancesValue::Count(n) if *n > 0 => u32::try_from(*n)
            .map(InstanceCount::Fixed)
            .map_err(|_| format!("instances {} is too large", n)),
        InstancesValue::Count(n) => Err(format!("instances must be positive, got {}", n)),
        InstancesValue::Keyword(text) if text.eq_ignore_ascii_case("max") => Ok(InstanceCount::Auto),
        InstancesValue::Keyword(text) => match text.trim().parse::<u32>() {
            Ok(n) if n > 0 => Ok(InstanceCount::Fixed(n)),
            _ => Err(format!(
                "instances must be a positive integer or \"max\", got '{}'",
                text
            )),
        },
    }
}

/// Parse `"1G"`, `"512M"`, `"300K"`, `"2048"` (case-insensitive, optional trailing `B`)
pub fn parse_memory_size(text: &str) -> std::result::Result<u64, String> {
    let trimmed = text.trim();
    let upper = trimmed.to_ascii_uppercase();
    let without_b = upper
        .strip_suffix('B')
        .filter(|rest| !rest.is_empty())
        .unwrap_or(&upper);

    let (number, multiplier) = match without_b.chars().last() {
        Some('K') => (&without_b[..without_b.len() - 1], 1024u64),
        Some('M') => (&without_b[..without_b.len() - 1], 1024 * 1024),
        Some('G') => (&without_b[..without_b.len() - 1], 1024 * 1024 * 1024),
        _ => (without_b, 1),
    };

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid memory size '{}'", text))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("invalid memory size '{}'", text));
    }

    Ok((value * multiplier as f64) as u64)
}

/// Expand `$VAR` and `${VAR}` from the process environment; unknown variables are kept verbatim
pub fn expand_env(text: &str) -> String {
    expand_with(text, |name| std::env::var(name).ok())
}

fn expand_with<F>(text: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(braced) = after.strip_prefix('{') {
            if let Some(end) = braced.find('}') {
                let name = &braced[..end];
                match lookup(name) {
                    Some(value) if is_var_name(name) => out.push_str(&value),
                    _ => out.push_str(&rest[pos..pos + end + 3]),
                }
                rest = &braced[end + 1..];
                continue;
            }
        }

        let len = after
            .char_indices()
            .find(|&(i, c)| !(c == '_' || c.is_ascii_alphanumeric()) || (i == 0 && c.is_ascii_digit()))
            .map(|(i, _)| i)
            .unwrap_or(after.len());
        let name = &after[..len];

        match (name.is_empty(), lookup(name)) {
            (false, Some(value)) => out.push_str(&value),
            _ => {
                out.push('$');
                out.push_str(name);
            }
        }
        rest = &after[len..];
    }

    out.push_str(rest);
    out
}

fn is_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const NEXT_AND_REACT: &str = r#"{
        "version": 1,
        "apps": [
            {
                "name": "nextjs-app",
                "script": "npm",
                "args": "start",
                "cwd": "/srv/next",
                "instances": "max",
                "exec_mode": "cluster",
                "env": { "NODE_ENV": "production", "PORT": 3000 },
                "log_date_format": "YYYY-MM-DD HH:mm:ss Z",
                "merge_logs": true,
                "max_memory_restart": "1G"
            },
            {
                "name": "react-app",
                "script": "serve",
                "args": ["-s", "build", "-l", "3001"],
                "watch": false
            }
        ]
    }"#;

    fn defaults(dir: &TempDir) -> SpecDefaults {
        SpecDefaults {
            log_dir: dir.path().to_path_buf(),
            ..SpecDefaults::default()
        }
    }

    #[test]
    fn test_parse_ecosystem_json() {
        let dir = TempDir::new().unwrap();
        let file = EcosystemFile::parse_json(NEXT_AND_REACT).unwrap();
        let specs = file.into_specs(dir.path(), &defaults(&dir)).unwrap();

        assert_eq!(specs.len(), 2);

        let next = &specs[0];
        assert_eq!(next.name, "nextjs-app");
        assert_eq!(next.command, PathBuf::from("npm"));
        assert_eq!(next.args, vec!["start"]);
        assert_eq!(next.instances, InstanceCount::Auto);
        assert_eq!(next.exec_mode, ExecMode::Clustered);
        assert_eq!(next.environment["PORT"], "3000");
        assert_eq!(next.environment["NODE_ENV"], "production");
        assert!(next.logs.merge);
        assert_eq!(next.memory_ceiling_bytes, Some(1024 * 1024 * 1024));
        assert_eq!(next.logs.stdout, dir.path().join("nextjs-app-out.log"));

        let react = &specs[1];
        assert_eq!(react.exec_mode, ExecMode::Single);
        assert_eq!(react.instances, InstanceCount::Fixed(1));
        assert_eq!(react.args, vec!["-s", "build", "-l", "3001"]);
        assert!(react.auto_restart);
        assert_eq!(react.logs.timestamp_format, None);
    }

    #[test]
    fn test_parse_ecosystem_toml() {
        let dir = TempDir::new().unwrap();
        let toml = r#"
version = 1

[[apps]]
name = "worker"
script = "/usr/bin/env"
args = "node worker.js"
instances = 2
exec_mode = "cluster_mode"
autorestart = false
kill_timeout = 3000
restart_delay = 250
max_restarts = 4

[apps.env]
DEBUG = true
RATIO = 0.5
"#;
        let file = EcosystemFile::parse_toml(toml).unwrap();
        let spec = file
            .into_specs(dir.path(), &defaults(&dir))
            .unwrap()
            .remove(0);

        assert_eq!(spec.instances, InstanceCount::Fixed(2));
        assert_eq!(spec.args, vec!["node", "worker.js"]);
        assert!(!spec.auto_restart);
        assert_eq!(spec.kill_timeout, Duration::from_millis(3000));
        assert_eq!(spec.restart_policy.max_restarts, 4);
        assert_eq!(
            spec.restart_policy.backoff,
            BackoffStrategy::Fixed {
                delay: Duration::from_millis(250)
            }
        );
        assert_eq!(spec.environment["DEBUG"], "true");
        assert_eq!(spec.environment["RATIO"], "0.5");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let json = r#"{"version": 1, "apps": [{"name": "a", "script": "x", "bogus": 1}]}"#;
        assert!(matches!(
            EcosystemFile::parse_json(json),
            Err(CorralError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let json = r#"{"version": 2, "apps": []}"#;
        let err = EcosystemFile::parse_json(json).unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn test_from_file_by_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ecosystem.json");
        fs::write(&path, NEXT_AND_REACT).unwrap();
        assert_eq!(EcosystemFile::from_file(&path).unwrap().apps.len(), 2);

        let yaml = dir.path().join("ecosystem.yaml");
        fs::write(&yaml, "apps: []").unwrap();
        assert!(matches!(
            EcosystemFile::from_file(&yaml),
            Err(CorralError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_relative_paths_resolve_against_base() {
        let dir = TempDir::new().unwrap();
        let json = r#"{"version": 1, "apps": [{
            "name": "api", "script": "./bin/server", "cwd": "app",
            "out_file": "logs/api.log"
        }]}"#;
        let spec = EcosystemFile::parse_json(json)
            .unwrap()
            .into_specs(dir.path(), &defaults(&dir))
            .unwrap()
            .remove(0);

        assert_eq!(spec.working_directory, Some(dir.path().join("app")));
        assert_eq!(spec.command, dir.path().join("app").join("./bin/server"));
        assert_eq!(spec.logs.stdout, dir.path().join("logs/api.log"));
    }

    #[test]
    fn test_bad_instances_and_exec_mode() {
        let dir = TempDir::new().unwrap();
        for json in [
            r#"{"version": 1, "apps": [{"name": "a", "script": "x", "instances": 0}]}"#,
            r#"{"version": 1, "apps": [{"name": "a", "script": "x", "instances": "lots"}]}"#,
            r#"{"version": 1, "apps": [{"name": "a", "script": "x", "exec_mode": "thread"}]}"#,
            r#"{"version": 1, "apps": [{"name": "a", "script": "x", "max_memory_restart": "big"}]}"#,
        ] {
            let result = EcosystemFile::parse_json(json)
                .unwrap()
                .into_specs(dir.path(), &defaults(&dir));
            assert!(
                matches!(result, Err(CorralError::InvalidConfig(_))),
                "accepted {}",
                json
            );
        }
    }

    #[test]
    fn test_exponential_backoff_wins() {
        let dir = TempDir::new().unwrap();
        let json = r#"{"version": 1, "apps": [{
            "name": "a", "script": "x",
            "restart_delay": 500, "exp_backoff_restart_delay": 100, "min_uptime": 2000
        }]}"#;
        let spec = EcosystemFile::parse_json(json)
            .unwrap()
            .into_specs(dir.path(), &defaults(&dir))
            .unwrap()
            .remove(0);

        assert_eq!(
            spec.restart_policy.backoff,
            BackoffStrategy::Exponential {
                initial: Duration::from_millis(100),
                max: Duration::from_secs(15)
            }
        );
        assert_eq!(spec.restart_policy.stable_after, Duration::from_secs(2));
    }

    #[test]
    fn test_parse_memory_size() {
        assert_eq!(parse_memory_size("1G"), Ok(1024 * 1024 * 1024));
        assert_eq!(parse_memory_size("512M"), Ok(512 * 1024 * 1024));
        assert_eq!(parse_memory_size("512mb"), Ok(512 * 1024 * 1024));
        assert_eq!(parse_memory_size("300K"), Ok(300 * 1024));
        assert_eq!(parse_memory_size("2048"), Ok(2048));
        assert_eq!(parse_memory_size("1.5G"), Ok(1536 * 1024 * 1024));
        assert!(parse_memory_size("").is_err());
        assert!(parse_memory_size("-1M").is_err());
        assert!(parse_memory_size("lots").is_err());
    }

    #[test]
    fn test_expand_env() {
        let lookup = |name: &str| match name {
            "HOME" => Some("/home/app".to_string()),
            "PORT" => Some("3000".to_string()),
            _ => None,
        };

        assert_eq!(expand_with("$HOME/app", lookup), "/home/app/app");
        assert_eq!(expand_with("${HOME}dir", lookup), "/home/appdir");
        assert_eq!(expand_with("$HOMEDIR", lookup), "$HOMEDIR");
        assert_eq!(expand_with("port=$PORT;", lookup), "port=3000;");
        assert_eq!(expand_with("${MISSING}", lookup), "${MISSING}");
        assert_eq!(expand_with("cost: $5", lookup), "cost: $5");
        assert_eq!(expand_with("trailing $", lookup), "trailing $");
    }
}
