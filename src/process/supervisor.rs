use crate::error::{CorralError, Result};
use crate::logs::{LogRouter, DEFAULT_MAX_LOG_SIZE};
use crate::process::manager::{InstanceManager, StartSummary};
use crate::process::monitor::{ResourceMonitor, DEFAULT_SAMPLE_INTERVAL_MS};
use crate::process::types::{ExitEvent, InstanceId, InstanceSnapshot, SupervisorEvent};
use crate::registry::{ProcessSpec, Registry};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Runtime knobs of the supervisor itself
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// How often the resource monitor samples memory and CPU
    pub sample_interval: Duration,
    /// Size at which log files rotate, 0 disables rotation
    pub log_max_bytes: u64,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(DEFAULT_SAMPLE_INTERVAL_MS),
            log_max_bytes: DEFAULT_MAX_LOG_SIZE,
        }
    }
}

/// What an operator command applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    All,
    App(String),
    Instance(InstanceId),
}

impl Target {
    /// `None` is everything, `name#n` one instance, anything else an app name
    pub fn parse(target: Option<&str>) -> Self {
        match target {
            None => Target::All,
            Some(text) => match InstanceId::parse(text) {
                Some(id) => Target::Instance(id),
                None => Target::App(text.to_string()),
            },
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::All => write!(f, "all"),
            Target::App(name) => write!(f, "{}", name),
            Target::Instance(id) => write!(f, "{}", id),
        }
    }
}

/// Outcome of a reload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadReport {
    pub generation: u64,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
    pub unchanged: Vec<String>,
    /// Instances that failed to launch or stop while applying the diff
    pub failed: Vec<(String, String)>,
}

/// Outcome of stopping a set of instances
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopSummary {
    pub stopped: Vec<InstanceId>,
    pub failed: Vec<(InstanceId, String)>,
}

impl StopSummary {
    pub fn from_results(results: Vec<(InstanceId, Result<()>)>) -> Self {
        let mut summary = Self::default();
        for (id, result) in results {
            match result {
                Ok(()) => summary.stopped.push(id),
                Err(e) => {
                    warn!(instance = %id, error = %e, "Failed to stop instance");
                    summary.failed.push((id, e.to_string()));
                }
            }
        }
        summary
    }
}

/// Control surface over the instance manager: lifecycle commands, status and reload
pub struct Supervisor {
    manager: Arc<InstanceManager>,
    registry: RwLock<Arc<Registry>>,
    reload_lock: Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    /// Create a supervisor with an empty registry.
    ///
    /// Must be called from within a tokio runtime: the exit dispatcher and the resource monitor
    /// are spawned here.
    pub fn new(options: SupervisorOptions) -> Arc<Self> {
        let logs = Arc::new(LogRouter::new(options.log_max_bytes));
        let (manager, exits) = InstanceManager::new(logs);

        let tasks = vec![
            tokio::spawn(dispatch_exits(Arc::clone(&manager), exits)),
            tokio::spawn(monitor_resources(
                Arc::clone(&manager),
                options.sample_interval,
            )),
        ];

        Arc::new(Self {
            manager,
            registry: RwLock::new(Arc::new(Registry::empty())),
            reload_lock: Mutex::new(()),
            tasks: Mutex::new(tasks),
        })
    }

    pub fn manager(&self) -> &Arc<InstanceManager> {
        &self.manager
    }

    pub async fn registry(&self) -> Arc<Registry> {
        Arc::clone(&*self.registry.read().await)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.manager.subscribe()
    }

    pub async fn status(&self) -> Vec<InstanceSnapshot> {
        self.manager.snapshot().await
    }

    /// Start every instance of every registered app
    pub async fn start_all(&self) -> StartSummary {
        let registry = self.registry().await;
        let mut summary = StartSummary::default();
        for spec in registry.specs() {
            summary.merge(self.manager.start(spec).await);
        }
        summary
    }

    pub async fn start(&self, target: &Target) -> Result<StartSummary> {
        match target {
            Target::All => Ok(self.start_all().await),
            Target::App(name) => {
                let spec = self.spec(name).await?;
                Ok(self.manager.start(&spec).await)
            }
            Target::Instance(id) => {
                let spec = self.spec(&id.name).await?;
                self.manager.start_instance(&spec, id.ordinal).await
            }
        }
    }

    /// Stop the targeted instances.
    ///
    /// Only an unknown target is an error; instances that fail to stop are listed in the
    /// summary next to the ones that did.
    pub async fn stop(&self, target: &Target, graceful: bool) -> Result<StopSummary> {
        let ids = self.resolve(target).await?;
        Ok(StopSummary::from_results(
            self.manager.stop_many(ids, graceful).await,
        ))
    }

    pub async fn stop_all(&self, graceful: bool) -> Vec<(InstanceId, Result<()>)> {
        self.manager.stop_all(graceful).await
    }

    pub async fn restart(&self, target: &Target) -> Result<Vec<InstanceId>> {
        let ids = self.resolve(target).await?;
        for id in &ids {
            self.manager.restart(id).await?;
        }
        Ok(ids)
    }

    /// Replace the registry with `specs` and reconcile running instances.
    ///
    /// Validation happens before anything is touched; an invalid list leaves everything as it
    /// was. Unchanged apps are not restarted, changed apps are stopped and started again.
    pub async fn reload(&self, specs: Vec<ProcessSpec>) -> Result<ReloadReport> {
        let _guard = self
            .reload_lock
            .try_lock()
            .map_err(|_| CorralError::ReloadConflict)?;

        let current = self.registry().await;
        let next = Registry::load(specs)?.with_generation(current.generation() + 1);
        let diff = Registry::diff(&current, &next);
        let generation = next.generation();

        *self.registry.write().await = Arc::new(next);

        let mut report = ReloadReport {
            generation,
            added: diff.added.iter().map(|s| s.name.clone()).collect(),
            removed: diff.removed.iter().map(|s| s.name.clone()).collect(),
            changed: diff.changed.iter().map(|s| s.name.clone()).collect(),
            unchanged: diff.unchanged.clone(),
            failed: Vec::new(),
        };

        info!(
            generation,
            added = report.added.len(),
            removed = report.removed.len(),
            changed = report.changed.len(),
            unchanged = report.unchanged.len(),
            "Reloading apps"
        );

        for spec in diff.removed.iter().chain(diff.changed.iter()) {
            for (id, result) in self.manager.remove_spec(&spec.name).await {
                if let Err(e) = result {
                    report.failed.push((id.to_string(), e.to_string()));
                }
            }
        }

        for spec in diff.changed.iter().chain(diff.added.iter()) {
            let summary = self.manager.start(spec).await;
            report.failed.extend(
                summary
                    .failed
                    .into_iter()
                    .map(|(id, error)| (id.to_string(), error)),
            );
        }

        self.manager.emit(SupervisorEvent::Reloaded { generation });
        Ok(report)
    }

    /// Stop everything gracefully, flush logs and stop the background tasks
    pub async fn shutdown(&self) {
        info!("Shutting down supervisor");

        for (id, result) in self.manager.stop_all(true).await {
            if let Err(e) = result {
                warn!(instance = %id, error = %e, "Failed to stop instance during shutdown");
            }
        }

        if let Err(e) = self.manager.logs().flush_all().await {
            warn!(error = %e, "Failed to flush logs during shutdown");
        }

        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }

    async fn spec(&self, name: &str) -> Result<Arc<ProcessSpec>> {
        self.registry()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| CorralError::InstanceNotFound(name.to_string()))
    }

    async fn resolve(&self, target: &Target) -> Result<Vec<InstanceId>> {
        match target {
            Target::All => Ok(self.manager.instance_ids().await),
            Target::App(name) => {
                let ids = self.manager.ids_of(name).await;
                if ids.is_empty() && self.registry().await.get(name).is_none() {
                    return Err(CorralError::InstanceNotFound(name.clone()));
                }
                Ok(ids)
            }
            Target::Instance(id) => {
                if self.manager.contains(id).await {
                    Ok(vec![id.clone()])
                } else {
                    Err(CorralError::InstanceNotFound(id.to_string()))
                }
            }
        }
    }
}

/// Feed exit watcher events back into the manager
async fn dispatch_exits(manager: Arc<InstanceManager>, mut exits: mpsc::UnboundedReceiver<ExitEvent>) {
    while let Some(event) = exits.recv().await {
        debug!(instance = %event.id, generation = event.generation, "Exit event");
        manager.notify_exit(event).await;
    }
}

/// Periodically sample usage and enforce memory ceilings
async fn monitor_resources(manager: Arc<InstanceManager>, interval: Duration) {
    let mut monitor = ResourceMonitor::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let live = manager.live_instances().await;
        if live.is_empty() {
            continue;
        }

        // sysinfo walks /proc synchronously
        let sampled = tokio::task::spawn_blocking(move || {
            let samples = monitor.sample(&live);
            (monitor, samples)
        })
        .await;

        let samples = match sampled {
            Ok((returned, samples)) => {
                monitor = returned;
                samples
            }
            Err(e) => {
                error!(error = %e, "Resource sampling failed");
                monitor = ResourceMonitor::new();
                continue;
            }
        };

        for sample in samples {
            manager
                .record_usage(&sample.id, sample.pid, sample.memory, sample.cpu)
                .await;

            if sample.over_limit() {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    if let Err(e) = manager
                        .enforce_memory_limit(&sample.id, sample.pid, sample.memory)
                        .await
                    {
                        warn!(instance = %sample.id, error = %e, "Memory limit restart failed");
                    }
                });
            }
        }
    }
}
