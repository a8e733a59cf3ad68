use crate::process::manager::LiveInstance;
use crate::process::InstanceId;
use std::collections::{HashMap, HashSet};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Default interval between two samples
pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 5000;

/// Usage measured for one instance
#[derive(Debug, Clone, PartialEq)]
pub struct UsageSample {
    pub id: InstanceId,
    pub pid: u32,
    /// Resident memory of the root process and all its descendants, in bytes
    pub memory: u64,
    /// CPU usage of the root process
    pub cpu: f32,
    pub memory_ceiling: Option<u64>,
}

impl UsageSample {
    pub fn over_limit(&self) -> bool {
        matches!(self.memory_ceiling, Some(limit) if self.memory > limit)
    }
}

/// Samples memory and CPU for supervised process trees
pub struct ResourceMonitor {
    system: System,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Refresh the process table and measure every live instance.
    ///
    /// Instances whose root process is already gone are skipped; their exit arrives through
    /// the exit watcher.
    pub fn sample(&mut self, live: &[LiveInstance]) -> Vec<UsageSample> {
        if live.is_empty() {
            return Vec::new();
        }

        // Descendants are needed too, so refresh everything at once
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::everything(),
        );

        let children = self.child_map();

        live.iter()
            .filter_map(|instance| {
                let root = Pid::from_u32(instance.pid);
                let cpu = self.system.process(root)?.cpu_usage();
                Some(UsageSample {
                    id: instance.id.clone(),
                    pid: instance.pid,
                    memory: self.tree_memory(root, &children),
                    cpu,
                    memory_ceiling: instance.memory_ceiling,
                })
            })
            .collect()
    }

    fn child_map(&self) -> HashMap<Pid, Vec<Pid>> {
        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (pid, process) in self.system.processes() {
            if let Some(parent) = process.parent() {
                children.entry(parent).or_default().push(*pid);
            }
        }
        children
    }

    fn tree_memory(&self, root: Pid, children: &HashMap<Pid, Vec<Pid>>) -> u64 {
        let mut total = 0;
        let mut stack = vec![root];
        let mut seen = HashSet::new();

        while let Some(pid) = stack.pop() {
            if !seen.insert(pid) {
                continue;
            }
            if let Some(process) = self.system.process(pid) {
                total += process.memory();
            }
            if let Some(kids) = children.get(&pid) {
                stack.extend(kids.iter().copied());
            }
        }

        total
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}
