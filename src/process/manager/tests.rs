use super::*;
use crate::process::restart::{BackoffStrategy, RestartPolicy};
use crate::registry::InstanceCount;
use tempfile::TempDir;
use tokio::time::{sleep, Instant};

fn manager() -> Arc<InstanceManager> {
    let (manager, mut exits) = InstanceManager::new(Arc::new(LogRouter::new(0)));
    let dispatcher = Arc::clone(&manager);
    tokio::spawn(async move {
        while let Some(event) = exits.recv().await {
            dispatcher.notify_exit(event).await;
        }
    });
    manager
}

fn sh(name: &str, dir: &TempDir, script: &str) -> Arc<ProcessSpec> {
    Arc::new(ProcessSpec::new(name, "/bin/sh", dir.path()).with_args(["-c", script]))
}

fn fast_policy(max_restarts: usize, delay_ms: u64) -> RestartPolicy {
    RestartPolicy {
        max_restarts,
        backoff: BackoffStrategy::Fixed {
            delay: Duration::from_millis(delay_ms),
        },
        ..RestartPolicy::new()
    }
}

async fn wait_for<F>(manager: &InstanceManager, id: &InstanceId, mut check: F) -> InstanceSnapshot
where
    F: FnMut(&InstanceSnapshot) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let snapshot = manager.get(id).await.expect("instance exists");
        if check(&snapshot) {
            return snapshot;
        }
        assert!(Instant::now() < deadline, "timed out, last state {:?}", snapshot);
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_start_single_instance() {
    let dir = TempDir::new().unwrap();
    let manager = manager();
    let spec = sh("api", &dir, "sleep 30");

    let summary = manager.start(&spec).await;
    assert_eq!(summary.started, vec![InstanceId::new("api", 0)]);
    assert!(summary.failed.is_empty());

    let snapshot = manager.get(&InstanceId::new("api", 0)).await.unwrap();
    assert_eq!(snapshot.state, InstanceState::Running);
    assert!(snapshot.pid.is_some());
    assert_eq!(snapshot.instance_id, "api#0");

    manager.stop_all(false).await;
}

#[tokio::test]
async fn test_start_clustered_instances() {
    let dir = TempDir::new().unwrap();
    let manager = manager();
    let spec = Arc::new(
        ProcessSpec::new("web", "/bin/sleep", dir.path())
            .with_args(["30"])
            .clustered(InstanceCount::Fixed(3)),
    );

    let summary = manager.start(&spec).await;
    assert_eq!(summary.started.len(), 3);

    let ids: Vec<String> = manager
        .snapshot()
        .await
        .into_iter()
        .map(|s| s.instance_id)
        .collect();
    assert_eq!(ids, vec!["web#0", "web#1", "web#2"]);

    manager.stop_all(false).await;
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let manager = manager();
    let spec = sh("api", &dir, "sleep 30");

    manager.start(&spec).await;
    let pid = manager.get(&InstanceId::new("api", 0)).await.unwrap().pid;

    let summary = manager.start(&spec).await;
    assert!(summary.started.is_empty());
    assert_eq!(summary.already_running, vec![InstanceId::new("api", 0)]);
    assert_eq!(manager.get(&InstanceId::new("api", 0)).await.unwrap().pid, pid);

    manager.stop_all(false).await;
}

#[tokio::test]
async fn test_graceful_stop_ends_stopped() {
    let dir = TempDir::new().unwrap();
    let manager = manager();
    let spec = sh("api", &dir, "sleep 30");
    let id = InstanceId::new("api", 0);

    manager.start(&spec).await;
    manager.stop(&id, true).await.unwrap();

    let snapshot = manager.get(&id).await.unwrap();
    assert_eq!(snapshot.state, InstanceState::Stopped);
    assert_eq!(snapshot.pid, None);
    assert_eq!(snapshot.last_exit_cause, Some(ExitCause::Signaled(15)));

    // The late watcher event must not turn it into a crash
    sleep(Duration::from_millis(200)).await;
    let snapshot = manager.get(&id).await.unwrap();
    assert_eq!(snapshot.state, InstanceState::Stopped);
    assert_eq!(snapshot.restart_count, 0);
}

#[tokio::test]
async fn test_stop_escalates_to_sigkill() {
    let dir = TempDir::new().unwrap();
    let manager = manager();
    let mut spec = ProcessSpec::new("stubborn", "/bin/sh", dir.path())
        .with_args(["-c", "trap '' TERM; sleep 30"]);
    spec.kill_timeout = Duration::from_millis(200);
    let spec = Arc::new(spec);
    let id = InstanceId::new("stubborn", 0);

    manager.start(&spec).await;
    // Give the shell time to install its trap
    sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    manager.stop(&id, true).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(200));

    let snapshot = manager.get(&id).await.unwrap();
    assert_eq!(snapshot.state, InstanceState::Stopped);
    assert_eq!(snapshot.last_exit_cause, Some(ExitCause::Signaled(9)));
}

#[tokio::test]
async fn test_stop_unknown_instance() {
    let manager = manager();
    let result = manager.stop(&InstanceId::new("ghost", 0), true).await;
    assert!(matches!(result, Err(CorralError::InstanceNotFound(_))));
}

#[tokio::test]
async fn test_no_restart_when_autorestart_disabled() {
    let dir = TempDir::new().unwrap();
    let manager = manager();
    let mut spec = ProcessSpec::new("once", "/bin/sh", dir.path()).with_args(["-c", "exit 3"]);
    spec.auto_restart = false;
    let spec = Arc::new(spec);
    let id = InstanceId::new("once", 0);

    manager.start(&spec).await;
    let snapshot = wait_for(&manager, &id, |s| s.state == InstanceState::Crashed).await;
    assert_eq!(snapshot.last_exit_code, Some(3));
    assert_eq!(snapshot.last_exit_cause, Some(ExitCause::Exited(3)));

    sleep(Duration::from_millis(300)).await;
    let snapshot = manager.get(&id).await.unwrap();
    assert_eq!(snapshot.state, InstanceState::Crashed);
    assert_eq!(snapshot.restart_count, 0);
    assert!(!snapshot.restart_pending);
}

#[tokio::test]
async fn test_crash_loop_gives_up() {
    let dir = TempDir::new().unwrap();
    let manager = manager();
    let mut events = manager.subscribe();
    let mut spec = ProcessSpec::new("flaky", "/bin/sh", dir.path()).with_args(["-c", "exit 1"]);
    spec.restart_policy = fast_policy(2, 10);
    let spec = Arc::new(spec);
    let id = InstanceId::new("flaky", 0);

    manager.start(&spec).await;
    let snapshot = wait_for(&manager, &id, |s| s.gave_up).await;

    assert_eq!(snapshot.state, InstanceState::Crashed);
    assert_eq!(snapshot.restart_count, 2);
    assert!(!snapshot.restart_pending);

    let mut saw_crash_loop = false;
    while let Ok(event) = events.try_recv() {
        if let SupervisorEvent::CrashLoop { id: looped, exits } = event {
            assert_eq!(looped, id);
            assert_eq!(exits, 3);
            saw_crash_loop = true;
        }
    }
    assert!(saw_crash_loop);
}

#[tokio::test]
async fn test_launch_failure_is_reported() {
    let dir = TempDir::new().unwrap();
    let manager = manager();
    let spec = Arc::new(ProcessSpec::new("broken", "/nonexistent/binary", dir.path()));
    let id = InstanceId::new("broken", 0);

    let summary = manager.start(&spec).await;
    assert!(summary.started.is_empty());
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].0, id);

    let snapshot = manager.get(&id).await.unwrap();
    assert_eq!(snapshot.state, InstanceState::Crashed);
    assert_eq!(snapshot.last_exit_cause, Some(ExitCause::LaunchFailed));
    assert!(snapshot.last_error.is_some());
}

#[tokio::test]
async fn test_stop_cancels_pending_restart() {
    let dir = TempDir::new().unwrap();
    let manager = manager();
    let mut spec = ProcessSpec::new("slow", "/bin/sh", dir.path()).with_args(["-c", "exit 1"]);
    spec.restart_policy = fast_policy(10, 5_000);
    let spec = Arc::new(spec);
    let id = InstanceId::new("slow", 0);

    manager.start(&spec).await;
    wait_for(&manager, &id, |s| s.restart_pending).await;

    manager.stop(&id, true).await.unwrap();
    let snapshot = manager.get(&id).await.unwrap();
    assert_eq!(snapshot.state, InstanceState::Stopped);
    assert!(!snapshot.restart_pending);
    assert_eq!(snapshot.restart_count, 0);
}

#[tokio::test]
async fn test_crashed_instance_restarts_with_backoff() {
    let dir = TempDir::new().unwrap();
    let manager = manager();
    let spec = sh("worker", &dir, "sleep 30");
    let id = InstanceId::new("worker", 0);

    manager.start(&spec).await;
    let first_pid = manager.get(&id).await.unwrap().pid.unwrap();

    // Killed from outside, not through the manager
    nix::sys::signal::killpg(
        nix::unistd::Pid::from_raw(first_pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();

    let snapshot = wait_for(&manager, &id, |s| {
        s.state == InstanceState::Running && s.pid != Some(first_pid)
    })
    .await;
    assert_eq!(snapshot.restart_count, 1);
    assert_eq!(snapshot.last_exit_cause, Some(ExitCause::Signaled(9)));

    manager.stop_all(false).await;
}

#[tokio::test]
async fn test_operator_restart_counts() {
    let dir = TempDir::new().unwrap();
    let manager = manager();
    let spec = sh("api", &dir, "sleep 30");
    let id = InstanceId::new("api", 0);

    manager.start(&spec).await;
    let first_pid = manager.get(&id).await.unwrap().pid;

    manager.restart(&id).await.unwrap();
    let snapshot = manager.get(&id).await.unwrap();
    assert_eq!(snapshot.state, InstanceState::Running);
    assert_eq!(snapshot.restart_count, 1);
    assert_ne!(snapshot.pid, first_pid);

    manager.stop_all(false).await;
}

#[tokio::test]
async fn test_start_after_stop_respawns() {
    let dir = TempDir::new().unwrap();
    let manager = manager();
    let spec = sh("api", &dir, "sleep 30");
    let id = InstanceId::new("api", 0);

    manager.start(&spec).await;
    manager.stop(&id, false).await.unwrap();

    let summary = manager.start(&spec).await;
    assert_eq!(summary.started, vec![id.clone()]);
    assert_eq!(
        manager.get(&id).await.unwrap().state,
        InstanceState::Running
    );

    manager.stop_all(false).await;
}

#[tokio::test]
async fn test_remove_spec_forgets_instances() {
    let dir = TempDir::new().unwrap();
    let manager = manager();
    let spec = Arc::new(
        ProcessSpec::new("web", "/bin/sleep", dir.path())
            .with_args(["30"])
            .clustered(InstanceCount::Fixed(2)),
    );

    manager.start(&spec).await;
    let results = manager.remove_spec("web").await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, r)| r.is_ok()));
    assert!(manager.snapshot().await.is_empty());
    assert_eq!(manager.logs().sink_count().await, 0);
}

#[tokio::test]
async fn test_memory_limit_restart_goes_through_policy() {
    let dir = TempDir::new().unwrap();
    let manager = manager();
    let mut spec = ProcessSpec::new("hog", "/bin/sh", dir.path()).with_args(["-c", "sleep 30"]);
    spec.memory_ceiling_bytes = Some(1024);
    spec.restart_policy = fast_policy(10, 10);
    let spec = Arc::new(spec);
    let id = InstanceId::new("hog", 0);

    manager.start(&spec).await;
    let pid = manager.get(&id).await.unwrap().pid.unwrap();

    manager
        .enforce_memory_limit(&id, pid, 4096)
        .await
        .unwrap();

    let snapshot = wait_for(&manager, &id, |s| {
        s.state == InstanceState::Running && s.pid != Some(pid)
    })
    .await;
    assert_eq!(
        snapshot.last_exit_cause,
        Some(ExitCause::MemoryLimitExceeded)
    );
    assert_eq!(snapshot.restart_count, 1);

    manager.stop_all(false).await;
}

#[tokio::test]
async fn test_live_instances_and_usage() {
    let dir = TempDir::new().unwrap();
    let manager = manager();
    let spec = sh("api", &dir, "sleep 30");
    let id = InstanceId::new("api", 0);

    manager.start(&spec).await;
    let live = manager.live_instances().await;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, id);

    manager.record_usage(&id, live[0].pid, 2048, 1.5).await;
    let snapshot = manager.get(&id).await.unwrap();
    assert_eq!(snapshot.memory_usage, 2048);

    // A stale pid is ignored
    manager.record_usage(&id, live[0].pid + 100_000, 1, 0.0).await;
    assert_eq!(manager.get(&id).await.unwrap().memory_usage, 2048);

    manager.stop_all(false).await;
}

#[tokio::test]
async fn test_stop_before_first_launch_ends_stopped() {
    let dir = TempDir::new().unwrap();
    let manager = manager();
    let spec = sh("api", &dir, "sleep 30");
    let id = InstanceId::new("api", 0);

    // The row as `start` inserts it, before its lock is taken for the launch
    manager.instances.write().await.insert(
        id.clone(),
        Arc::new(Mutex::new(Instance::new(id.clone(), Arc::clone(&spec), 1))),
    );

    manager.stop(&id, true).await.unwrap();
    let snapshot = manager.get(&id).await.unwrap();
    assert_eq!(snapshot.state, InstanceState::Stopped);
    assert_eq!(snapshot.pid, None);

    let summary = manager.start(&spec).await;
    assert!(summary.failed.is_empty(), "{:?}", summary.failed);
    assert_eq!(summary.started, vec![id.clone()]);
    assert_eq!(manager.get(&id).await.unwrap().state, InstanceState::Running);

    manager.stop_all(false).await;
}
