// Registry module - The validated set of process specs for one generation

mod spec;

pub use spec::{cpu_parallelism, ExecMode, InstanceCount, LogPaths, ProcessSpec};

use crate::error::{CorralError, Result};
use crate::logs::TimestampFormat;
use std::collections::{BTreeMap, HashSet};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Immutable set of specs keyed by name
#[derive(Debug, Clone, Default)]
pub struct Registry {
    specs: BTreeMap<String, Arc<ProcessSpec>>,
    generation: u64,
}

/// Difference between two registries
#[derive(Debug, Clone, Default)]
pub struct SpecDiff {
    pub added: Vec<Arc<ProcessSpec>>,
    pub removed: Vec<Arc<ProcessSpec>>,
    /// New versions of specs whose definition changed
    pub changed: Vec<Arc<ProcessSpec>>,
    pub unchanged: Vec<String>,
}

impl SpecDiff {
    /// True when applying the diff requires no start or stop
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

impl Registry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Validate `specs` and build a registry, rejecting the whole list on the first problem
    pub fn load(specs: Vec<ProcessSpec>) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut probed_dirs = HashSet::new();
        let mut map = BTreeMap::new();

        for spec in specs {
            validate_spec(&spec)?;

            if !seen.insert(spec.name.clone()) {
                return Err(CorralError::Validation(format!(
                    "duplicate app name '{}'",
                    spec.name
                )));
            }

            for path in [&spec.logs.stdout, &spec.logs.stderr] {
                check_log_path(&spec.name, path, &mut probed_dirs)?;
            }

            map.insert(spec.name.clone(), Arc::new(spec));
        }

        Ok(Self {
            specs: map,
            generation: 0,
        })
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ProcessSpec>> {
        self.specs.get(name)
    }

    pub fn specs(&self) -> impl Iterator<Item = &Arc<ProcessSpec>> {
        self.specs.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Compute what has to change to go from `old` to `new`
    pub fn diff(old: &Registry, new: &Registry) -> SpecDiff {
        let mut diff = SpecDiff::default();

        for (name, spec) in &new.specs {
            match old.specs.get(name) {
                None => diff.added.push(Arc::clone(spec)),
                Some(previous) if previous.as_ref() != spec.as_ref() => {
                    diff.changed.push(Arc::clone(spec))
                }
                Some(_) => diff.unchanged.push(name.clone()),
            }
        }

        for (name, spec) in &old.specs {
            if !new.specs.contains_key(name) {
                diff.removed.push(Arc::clone(spec));
            }
        }

        diff
    }
}

fn validate_spec(spec: &ProcessSpec) -> Result<()> {
    if spec.name.trim().is_empty() {
        return Err(CorralError::Validation("app name must not be empty".to_string()));
    }

    if spec.name.contains('#') || spec.name.contains('/') {
        return Err(CorralError::Validation(format!(
            "app name '{}' must not contain '#' or '/'",
            spec.name
        )));
    }

    if spec.command.as_os_str().is_empty() || spec.command.to_string_lossy().trim().is_empty() {
        return Err(CorralError::Validation(format!(
            "app '{}' has an empty command",
            spec.name
        )));
    }

    match (spec.exec_mode, spec.instances) {
        (_, InstanceCount::Fixed(0)) => {
            return Err(CorralError::Validation(format!(
                "app '{}': instances must be a positive integer or \"max\"",
                spec.name
            )));
        }
        (ExecMode::Single, InstanceCount::Fixed(1)) => {}
        (ExecMode::Single, count) => {
            return Err(CorralError::Validation(format!(
                "app '{}': fork mode runs exactly one instance, got {}",
                spec.name, count
            )));
        }
        (ExecMode::Clustered, _) => {}
    }

    if spec.memory_ceiling_bytes == Some(0) {
        return Err(CorralError::Validation(format!(
            "app '{}': max_memory_restart must be greater than zero",
            spec.name
        )));
    }

    if spec.restart_policy.max_restarts == 0 && spec.auto_restart {
        return Err(CorralError::Validation(format!(
            "app '{}': max_restarts must be at least 1",
            spec.name
        )));
    }

    if let Some(ref format) = spec.logs.timestamp_format {
        if let Err(CorralError::Validation(reason)) = TimestampFormat::parse(format) {
            return Err(CorralError::Validation(format!("app '{}': {}", spec.name, reason)));
        }
    }

    Ok(())
}

/// Make sure a log destination can be written.
///
/// Existing paths (including `/dev/null`) are opened for append. For new files the directory is
/// created and probed once.
fn check_log_path(name: &str, path: &Path, probed_dirs: &mut HashSet<PathBuf>) -> Result<()> {
    let unwritable = |reason: String| {
        CorralError::Validation(format!(
            "app '{}': log path {} is not writable: {}",
            name,
            path.display(),
            reason
        ))
    };

    if path.exists() {
        if path.is_dir() {
            return Err(unwritable("is a directory".to_string()));
        }
        OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|e| unwritable(e.to_string()))?;
        return Ok(());
    }

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    if probed_dirs.contains(&dir) {
        return Ok(());
    }

    std::fs::create_dir_all(&dir).map_err(|e| unwritable(e.to_string()))?;

    let probe = dir.join(format!(".corral-probe-{}", std::process::id()));
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&probe)
        .map_err(|e| unwritable(e.to_string()))?;
    let _ = std::fs::remove_file(&probe);

    probed_dirs.insert(dir);
    Ok(())
}
