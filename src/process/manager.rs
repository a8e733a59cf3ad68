use crate::error::{CorralError, Result};
use crate::logs::LogRouter;
use crate::process::restart::RestartDecision;
use crate::process::spawner::spawn_instance;
use crate::process::types::{
    ExitCause, ExitEvent, ExitOutcome, Instance, InstanceId, InstanceSnapshot, InstanceState,
    SupervisorEvent,
};
use crate::registry::ProcessSpec;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinSet;

#[cfg(test)]
mod tests;

/// How long to wait for the exit after SIGKILL before reporting a stuck process
const KILL_WAIT: Duration = Duration::from_secs(5);
const EVENT_CAPACITY: usize = 256;

type Slot = Arc<Mutex<Instance>>;

/// Result of starting every instance of a spec
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartSummary {
    pub started: Vec<InstanceId>,
    pub already_running: Vec<InstanceId>,
    pub failed: Vec<(InstanceId, String)>,
}

impl StartSummary {
    pub fn merge(&mut self, other: StartSummary) {
        self.started.extend(other.started);
        self.already_running.extend(other.already_running);
        self.failed.extend(other.failed);
    }
}

/// A running instance as seen by the resource monitor
#[derive(Debug, Clone)]
pub struct LiveInstance {
    pub id: InstanceId,
    pub pid: u32,
    pub memory_ceiling: Option<u64>,
}

/// Owns every instance and drives its lifecycle
pub struct InstanceManager {
    instances: RwLock<BTreeMap<InstanceId, Slot>>,
    logs: Arc<LogRouter>,
    exit_tx: mpsc::UnboundedSender<ExitEvent>,
    events: broadcast::Sender<SupervisorEvent>,
    next_generation: AtomicU64,
}

impl InstanceManager {
    /// Create a manager; exit events must be fed back through [`notify_exit`](Self::notify_exit)
    pub fn new(logs: Arc<LogRouter>) -> (Arc<Self>, mpsc::UnboundedReceiver<ExitEvent>) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let manager = Arc::new(Self {
            instances: RwLock::new(BTreeMap::new()),
            logs,
            exit_tx,
            events,
            next_generation: AtomicU64::new(1),
        });

        (manager, exit_rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    pub fn logs(&self) -> &Arc<LogRouter> {
        &self.logs
    }

    pub(crate) fn emit(&self, event: SupervisorEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn slot(&self, id: &InstanceId) -> Option<Slot> {
        self.instances.read().await.get(id).cloned()
    }

    async fn require(&self, id: &InstanceId) -> Result<Slot> {
        self.slot(id)
            .await
            .ok_or_else(|| CorralError::InstanceNotFound(id.to_string()))
    }

    pub async fn instance_ids(&self) -> Vec<InstanceId> {
        self.instances.read().await.keys().cloned().collect()
    }

    pub async fn ids_of(&self, name: &str) -> Vec<InstanceId> {
        self.instances
            .read()
            .await
            .keys()
            .filter(|id| id.name == name)
            .cloned()
            .collect()
    }

    pub async fn contains(&self, id: &InstanceId) -> bool {
        self.instances.read().await.contains_key(id)
    }

    /// Start every instance of `spec`.
    ///
    /// Running instances are left alone. Stopped or crashed ones are launched again with a
    /// fresh restart history.
    pub async fn start(self: &Arc<Self>, spec: &Arc<ProcessSpec>) -> StartSummary {
        let count = spec.instance_count();
        let mut summary = StartSummary::default();

        for ordinal in 0..count as u32 {
            self.start_one(spec, ordinal, count, &mut summary).await;
        }

        tracing::info!(
            app = %spec.name,
            mode = %spec.exec_mode,
            started = summary.started.len(),
            failed = summary.failed.len(),
            "Started app"
        );

        summary
    }

    /// Start a single ordinal of `spec`
    pub async fn start_instance(
        self: &Arc<Self>,
        spec: &Arc<ProcessSpec>,
        ordinal: u32,
    ) -> Result<StartSummary> {
        let count = spec.instance_count();
        if ordinal as usize >= count {
            return Err(CorralError::InstanceNotFound(
                InstanceId::new(&spec.name, ordinal).to_string(),
            ));
        }

        let mut summary = StartSummary::default();
        self.start_one(spec, ordinal, count, &mut summary).await;
        Ok(summary)
    }

    async fn start_one(
        self: &Arc<Self>,
        spec: &Arc<ProcessSpec>,
        ordinal: u32,
        count: usize,
        summary: &mut StartSummary,
    ) {
        let id = InstanceId::new(&spec.name, ordinal);
        let slot = {
            let mut instances = self.instances.write().await;
            Arc::clone(instances.entry(id.clone()).or_insert_with(|| {
                Arc::new(Mutex::new(Instance::new(id.clone(), Arc::clone(spec), count)))
            }))
        };

        let mut instance = slot.lock().await;
        match instance.state {
            InstanceState::Starting if instance.never_launched() => {}
            InstanceState::Starting | InstanceState::Running => {
                summary.already_running.push(id);
                return;
            }
            InstanceState::Stopping => {
                tracing::warn!(instance = %id, "Instance is stopping, not starting it");
                summary
                    .failed
                    .push((id, "instance is currently stopping".to_string()));
                return;
            }
            InstanceState::Stopped | InstanceState::Crashed => {
                instance.cancel_pending_restart();
                instance.tracker.clear();
                instance.gave_up = false;
                instance.spec = Arc::clone(spec);
                instance.cluster_size = count;
            }
        }

        match self.launch(&mut instance).await {
            Ok(()) => summary.started.push(id),
            Err(e) => summary.failed.push((id, e.to_string())),
        }
    }

    /// Spawn the child for `instance` and start watching it
    async fn launch(&self, instance: &mut Instance) -> Result<()> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        instance.spawn_generation = generation;
        instance.state = InstanceState::Starting;
        instance.stop_requested = false;
        instance.pending_cause = None;
        instance.memory_usage = 0;
        instance.cpu_usage = 0.0;

        let spec = Arc::clone(&instance.spec);
        let mut spawned = match spawn_instance(&spec, instance.id.ordinal, instance.cluster_size) {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!(instance = %instance.id, error = %e, "Failed to launch instance");
                instance.state = InstanceState::Crashed;
                instance.pid = None;
                instance.started_at = None;
                instance.exit_rx = None;
                instance.exit_handled = true;
                instance.last_error = Some(e.to_string());
                instance.last_exit_cause = Some(ExitCause::LaunchFailed);
                self.emit(SupervisorEvent::LaunchFailed {
                    id: instance.id.clone(),
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let stdout = spawned.child.stdout.take();
        let stderr = spawned.child.stderr.take();
        if let Err(e) = self.logs.attach(&instance.id, &spec, stdout, stderr).await {
            tracing::warn!(instance = %instance.id, error = %e, "Output will not be captured");
        }

        let (outcome_tx, outcome_rx) = watch::channel(None);
        instance.exit_rx = Some(outcome_rx);
        instance.exit_handled = false;
        instance.pid = Some(spawned.pid);
        instance.started_at = Some(std::time::Instant::now());
        instance.started_wall = Some(std::time::SystemTime::now());
        instance.last_error = None;
        instance.state = InstanceState::Running;

        let id = instance.id.clone();
        let exit_tx = self.exit_tx.clone();
        let mut child = spawned.child;
        tokio::spawn(async move {
            let outcome = match child.wait().await {
                Ok(status) => ExitOutcome::from_status(status),
                Err(e) => {
                    tracing::warn!(instance = %id, error = %e, "Failed to wait on child");
                    ExitOutcome::unknown()
                }
            };
            let _ = outcome_tx.send(Some(outcome));
            let _ = exit_tx.send(ExitEvent {
                id,
                generation,
                outcome,
            });
        });

        tracing::info!(instance = %instance.id, pid = spawned.pid, "Instance running");
        self.emit(SupervisorEvent::Started {
            id: instance.id.clone(),
            pid: spawned.pid,
        });

        Ok(())
    }

    /// Stop one instance and wait until it has exited.
    ///
    /// Graceful stops send SIGTERM to the process group and escalate to SIGKILL after the
    /// spec's grace period. A pending restart is cancelled either way.
    pub async fn stop(self: &Arc<Self>, id: &InstanceId, graceful: bool) -> Result<()> {
        let slot = self.require(id).await?;

        let (pid, exit_rx, grace, generation) = {
            let mut instance = slot.lock().await;
            let cancelled = instance.cancel_pending_restart();

            match instance.state {
                InstanceState::Stopped => return Ok(()),
                InstanceState::Crashed => {
                    if cancelled {
                        tracing::info!(instance = %id, "Cancelled pending restart");
                    }
                    instance.state = InstanceState::Stopped;
                    instance.gave_up = false;
                    self.emit(SupervisorEvent::Stopped { id: id.clone() });
                    return Ok(());
                }
                _ => {}
            }

            // Nothing to signal: the row exists but no child was ever watched
            let (Some(pid), Some(exit_rx)) = (instance.pid, instance.exit_rx.clone()) else {
                instance.stop_requested = false;
                instance.state = InstanceState::Stopped;
                tracing::info!(instance = %id, "Instance stopped before launch");
                self.emit(SupervisorEvent::Stopped { id: id.clone() });
                return Ok(());
            };

            instance.stop_requested = true;
            instance.state = InstanceState::Stopping;
            (
                pid,
                exit_rx,
                instance.spec.kill_timeout,
                instance.spawn_generation,
            )
        };

        tracing::info!(instance = %id, pid, graceful, "Stopping instance");
        let outcome = terminate(id, pid, exit_rx, graceful, grace).await?;

        // Reap anything the root left behind in its group
        let _ = signal_group(pid, Signal::Kill);

        self.handle_exit(&slot, generation, outcome).await;
        Ok(())
    }

    /// Stop several instances concurrently
    pub async fn stop_many(
        self: &Arc<Self>,
        ids: Vec<InstanceId>,
        graceful: bool,
    ) -> Vec<(InstanceId, Result<()>)> {
        let mut set = JoinSet::new();
        for id in ids {
            let manager = Arc::clone(self);
            set.spawn(async move {
                let result = manager.stop(&id, graceful).await;
                (id, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::error!(error = %e, "Stop task failed"),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    pub async fn stop_all(self: &Arc<Self>, graceful: bool) -> Vec<(InstanceId, Result<()>)> {
        let ids = self.instance_ids().await;
        self.stop_many(ids, graceful).await
    }

    /// Operator restart: graceful stop, then a fresh launch counted as a restart
    pub async fn restart(self: &Arc<Self>, id: &InstanceId) -> Result<()> {
        self.stop(id, true).await?;

        let slot = self.require(id).await?;
        let mut instance = slot.lock().await;
        if !matches!(
            instance.state,
            InstanceState::Stopped | InstanceState::Crashed
        ) {
            return Ok(());
        }

        instance.cancel_pending_restart();
        instance.tracker.clear();
        instance.gave_up = false;
        instance.restart_count += 1;
        self.launch(&mut instance).await
    }

    /// Stop every instance of `name`, forget them and close the app's log sinks
    pub async fn remove_spec(self: &Arc<Self>, name: &str) -> Vec<(InstanceId, Result<()>)> {
        let ids = self.ids_of(name).await;
        let results = self.stop_many(ids.clone(), true).await;

        {
            let mut instances = self.instances.write().await;
            for id in &ids {
                instances.remove(id);
            }
        }

        self.logs.close(name).await;
        tracing::info!(app = name, instances = ids.len(), "Removed app");
        results
    }

    /// Entry point for exit watcher events
    pub async fn notify_exit(self: &Arc<Self>, event: ExitEvent) {
        let Some(slot) = self.slot(&event.id).await else {
            tracing::debug!(instance = %event.id, "Exit for a removed instance");
            return;
        };
        self.handle_exit(&slot, event.generation, event.outcome).await;
    }

    async fn handle_exit(self: &Arc<Self>, slot: &Slot, generation: u64, outcome: ExitOutcome) {
        let mut instance = slot.lock().await;
        if instance.spawn_generation != generation || instance.exit_handled {
            tracing::debug!(instance = %instance.id, generation, "Ignoring stale exit");
            return;
        }
        instance.exit_handled = true;

        let uptime = instance.uptime();
        instance.pid = None;
        instance.started_at = None;
        instance.memory_usage = 0;
        instance.cpu_usage = 0.0;
        instance.last_exit_code = outcome.code;
        let cause = instance
            .pending_cause
            .take()
            .unwrap_or_else(|| outcome.cause());
        instance.last_exit_cause = Some(cause);

        if instance.stop_requested {
            instance.stop_requested = false;
            instance.state = InstanceState::Stopped;
            tracing::info!(instance = %instance.id, "Instance stopped");
            self.emit(SupervisorEvent::Stopped {
                id: instance.id.clone(),
            });
            return;
        }

        instance.state = InstanceState::Crashed;
        tracing::warn!(
            instance = %instance.id,
            cause = %cause,
            uptime_ms = uptime.as_millis() as u64,
            "Instance exited"
        );
        self.emit(SupervisorEvent::Exited {
            id: instance.id.clone(),
            cause,
        });

        let decision = instance
            .spec
            .effective_restart_policy()
            .on_exit(&mut instance.tracker, uptime);
        self.apply_decision(&mut instance, decision);
    }

    fn apply_decision(self: &Arc<Self>, instance: &mut Instance, decision: RestartDecision) {
        match decision {
            RestartDecision::RestartNow => self.schedule_restart(instance, Duration::ZERO),
            RestartDecision::RestartAfter(delay) => self.schedule_restart(instance, delay),
            RestartDecision::GiveUp if instance.spec.effective_restart_policy().enabled => {
                let exits = instance.tracker.recent_exits();
                instance.gave_up = true;
                tracing::error!(
                    instance = %instance.id,
                    exits,
                    "Crash loop detected, giving up"
                );
                self.emit(SupervisorEvent::CrashLoop {
                    id: instance.id.clone(),
                    exits,
                });
            }
            RestartDecision::GiveUp => {
                tracing::info!(instance = %instance.id, "Autorestart disabled, leaving instance down");
            }
        }
    }

    fn schedule_restart(self: &Arc<Self>, instance: &mut Instance, delay: Duration) {
        let manager = Arc::clone(self);
        let id = instance.id.clone();
        let expected = instance.spawn_generation;

        tracing::info!(instance = %id, delay_ms = delay.as_millis() as u64, "Scheduling restart");
        self.emit(SupervisorEvent::RestartScheduled {
            id: id.clone(),
            delay,
        });

        instance.cancel_pending_restart();
        instance.pending_restart = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            manager.respawn(&id, expected).await;
        }));
    }

    async fn respawn(self: &Arc<Self>, id: &InstanceId, expected_generation: u64) {
        let Some(slot) = self.slot(id).await else {
            return;
        };
        let mut instance = slot.lock().await;
        instance.pending_restart = None;

        if instance.state != InstanceState::Crashed || instance.spawn_generation != expected_generation
        {
            return;
        }

        instance.restart_count += 1;
        if self.launch(&mut instance).await.is_err() {
            // A failed relaunch counts as another exit
            let decision = instance
                .spec
                .effective_restart_policy()
                .on_exit(&mut instance.tracker, Duration::ZERO);
            self.apply_decision(&mut instance, decision);
        }
    }

    /// Running instances with their root pid
    pub async fn live_instances(&self) -> Vec<LiveInstance> {
        let slots: Vec<Slot> = self.instances.read().await.values().cloned().collect();

        let mut live = Vec::new();
        for slot in slots {
            let instance = slot.lock().await;
            if let (InstanceState::Running, Some(pid)) = (instance.state, instance.pid) {
                live.push(LiveInstance {
                    id: instance.id.clone(),
                    pid,
                    memory_ceiling: instance.spec.memory_ceiling_bytes,
                });
            }
        }
        live
    }

    pub async fn record_usage(&self, id: &InstanceId, pid: u32, memory: u64, cpu: f32) {
        if let Some(slot) = self.slot(id).await {
            let mut instance = slot.lock().await;
            if instance.pid == Some(pid) {
                instance.memory_usage = memory;
                instance.cpu_usage = cpu;
            }
        }
    }

    /// Terminate an instance that went over its memory ceiling.
    ///
    /// Unlike `stop`, the exit is not marked as requested, so it flows through the restart
    /// policy as `MemoryLimitExceeded`.
    pub async fn enforce_memory_limit(
        self: &Arc<Self>,
        id: &InstanceId,
        pid: u32,
        usage: u64,
    ) -> Result<()> {
        let slot = self.require(id).await?;

        let (exit_rx, grace, limit) = {
            let mut instance = slot.lock().await;
            if instance.state != InstanceState::Running
                || instance.pid != Some(pid)
                || instance.pending_cause.is_some()
            {
                return Ok(());
            }
            let limit = instance.spec.memory_ceiling_bytes.unwrap_or(0);
            instance.pending_cause = Some(ExitCause::MemoryLimitExceeded);
            (instance.exit_rx.clone(), instance.spec.kill_timeout, limit)
        };

        tracing::warn!(instance = %id, pid, usage, limit, "Memory limit exceeded, restarting");
        self.emit(SupervisorEvent::MemoryLimitExceeded {
            id: id.clone(),
            usage,
            limit,
        });

        if let Some(exit_rx) = exit_rx {
            terminate(id, pid, exit_rx, true, grace).await?;
            let _ = signal_group(pid, Signal::Kill);
        }
        Ok(())
    }

    pub async fn get(&self, id: &InstanceId) -> Option<InstanceSnapshot> {
        let slot = self.slot(id).await?;
        let instance = slot.lock().await;
        Some(instance.snapshot())
    }

    pub async fn snapshot(&self) -> Vec<InstanceSnapshot> {
        let slots: Vec<Slot> = self.instances.read().await.values().cloned().collect();

        let mut snapshots = Vec::with_capacity(slots.len());
        for slot in slots {
            snapshots.push(slot.lock().await.snapshot());
        }
        snapshots
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// Send a signal to the whole process group led by `pid`
#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal as NixSignal};
    use nix::unistd::Pid;

    let nix_signal = match signal {
        Signal::Term => NixSignal::SIGTERM,
        Signal::Kill => NixSignal::SIGKILL,
    };

    match killpg(Pid::from_raw(pid as i32), nix_signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(CorralError::Signal(format!(
            "Failed to send {:?} to group {}: {}",
            nix_signal, pid, e
        ))),
    }
}

#[cfg(not(unix))]
fn signal_group(pid: u32, _signal: Signal) -> Result<()> {
    Err(CorralError::Signal(format!(
        "Process group signals are not supported on this platform (pid {})",
        pid
    )))
}

async fn wait_for_exit(exit_rx: &mut watch::Receiver<Option<ExitOutcome>>) -> ExitOutcome {
    match exit_rx.wait_for(Option::is_some).await {
        Ok(outcome) => {
            let outcome = *outcome;
            outcome.unwrap_or_else(ExitOutcome::unknown)
        }
        // Watcher gone without reporting, the child is reaped either way
        Err(_) => ExitOutcome::unknown(),
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL
async fn terminate(
    id: &InstanceId,
    pid: u32,
    mut exit_rx: watch::Receiver<Option<ExitOutcome>>,
    graceful: bool,
    grace: Duration,
) -> Result<ExitOutcome> {
    if graceful {
        signal_group(pid, Signal::Term)
            .map_err(|e| CorralError::Stop(id.to_string(), e.to_string()))?;

        match tokio::time::timeout(grace, wait_for_exit(&mut exit_rx)).await {
            Ok(outcome) => return Ok(outcome),
            Err(_) => {
                tracing::warn!(
                    instance = %id,
                    pid,
                    grace_ms = grace.as_millis() as u64,
                    "Instance ignored SIGTERM, sending SIGKILL"
                );
            }
        }
    }

    signal_group(pid, Signal::Kill).map_err(|e| CorralError::Stop(id.to_string(), e.to_string()))?;

    tokio::time::timeout(KILL_WAIT, wait_for_exit(&mut exit_rx))
        .await
        .map_err(|_| {
            CorralError::Timeout(format!("{} did not exit after SIGKILL", id))
        })
}
