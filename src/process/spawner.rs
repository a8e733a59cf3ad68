use crate::error::{CorralError, Result};
use crate::registry::ProcessSpec;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Environment variable carrying the instance ordinal
pub const INSTANCE_ENV: &str = "NODE_APP_INSTANCE";
/// Environment variable carrying the cluster size, clustered specs only
pub const CLUSTER_SIZE_ENV: &str = "CORRAL_CLUSTER_SIZE";

/// A freshly launched child
#[derive(Debug)]
pub struct SpawnedInstance {
    /// The child process handle, stdout/stderr still attached
    pub child: Child,

    /// Process ID assigned by the OS, also the process group ID
    pub pid: u32,
}

/// Launch one instance of `spec`.
///
/// The command is resolved through `PATH` the usual way, so `npm` works as well as an absolute
/// path. The child gets its own process group, a null stdin and piped stdout/stderr.
pub fn spawn_instance(spec: &ProcessSpec, ordinal: u32, cluster_size: usize) -> Result<SpawnedInstance> {
    let mut command = Command::new(&spec.command);

    if !spec.args.is_empty() {
        command.args(&spec.args);
    }

    if let Some(ref cwd) = spec.working_directory {
        command.current_dir(cwd);
    }

    command.envs(&spec.environment);
    command.env(INSTANCE_ENV, ordinal.to_string());
    if spec.is_clustered() {
        command.env(CLUSTER_SIZE_ENV, cluster_size.to_string());
    }

    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    #[cfg(unix)]
    command.process_group(0);

    let child = command.spawn().map_err(|e| {
        CorralError::Spawn(
            format!("{}#{}", spec.name, ordinal),
            format!("{}: {}", spec.command.display(), e),
        )
    })?;

    let pid = child.id().ok_or_else(|| {
        CorralError::Spawn(
            format!("{}#{}", spec.name, ordinal),
            "exited before its pid could be read".to_string(),
        )
    })?;

    tracing::debug!(app = %spec.name, ordinal, pid, "Spawned instance");

    Ok(SpawnedInstance { child, pid })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn shell(dir: &TempDir, script: &str) -> ProcessSpec {
        ProcessSpec::new("test-sh", "/bin/sh", dir.path()).with_args(["-c", script])
    }

    async fn stdout_of(mut spawned: SpawnedInstance) -> String {
        let mut out = String::new();
        if let Some(mut stdout) = spawned.child.stdout.take() {
            stdout.read_to_string(&mut out).await.unwrap();
        }
        spawned.child.wait().await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_spawn_simple_process() {
        let dir = TempDir::new().unwrap();
        let spawned = spawn_instance(&shell(&dir, "echo hello"), 0, 1).unwrap();
        assert!(spawned.pid > 0);
        assert_eq!(stdout_of(spawned).await, "hello\n");
    }

    #[tokio::test]
    async fn test_spawn_resolves_command_on_path() {
        let dir = TempDir::new().unwrap();
        let spec = ProcessSpec::new("echo", "echo", dir.path()).with_args(["from", "path"]);
        let spawned = spawn_instance(&spec, 0, 1).unwrap();
        assert_eq!(stdout_of(spawned).await, "from path\n");
    }

    #[tokio::test]
    async fn test_spawn_with_working_directory() {
        let dir = TempDir::new().unwrap();
        let mut spec = shell(&dir, "pwd");
        spec.working_directory = Some(dir.path().to_path_buf());

        let out = stdout_of(spawn_instance(&spec, 0, 1).unwrap()).await;
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(
            std::path::Path::new(out.trim()).canonicalize().unwrap(),
            expected
        );
    }

    #[tokio::test]
    async fn test_spawn_sets_environment_and_instance_vars() {
        let dir = TempDir::new().unwrap();
        let mut spec = shell(
            &dir,
            "echo \"$PORT $NODE_APP_INSTANCE ${CORRAL_CLUSTER_SIZE:-none}\"",
        );
        spec.environment
            .insert("PORT".to_string(), "3000".to_string());

        let out = stdout_of(spawn_instance(&spec, 0, 1).unwrap()).await;
        assert_eq!(out, "3000 0 none\n");

        let clustered = spec.clone().clustered(crate::registry::InstanceCount::Fixed(4));
        let out = stdout_of(spawn_instance(&clustered, 2, 4).unwrap()).await;
        assert_eq!(out, "3000 2 4\n");
    }

    #[tokio::test]
    async fn test_spawn_nonexistent_command() {
        let dir = TempDir::new().unwrap();
        let spec = ProcessSpec::new("missing", "/nonexistent/script", dir.path());

        match spawn_instance(&spec, 0, 1) {
            Err(CorralError::Spawn(id, _)) => assert_eq!(id, "missing#0"),
            other => panic!("Expected Spawn error, got {:?}", other.map(|s| s.pid)),
        }
    }

    #[tokio::test]
    async fn test_spawn_invalid_working_directory() {
        let dir = TempDir::new().unwrap();
        let mut spec = shell(&dir, "true");
        spec.working_directory = Some("/nonexistent/directory".into());

        assert!(matches!(
            spawn_instance(&spec, 0, 1),
            Err(CorralError::Spawn(_, _))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_leads_its_own_process_group() {
        let dir = TempDir::new().unwrap();
        let mut spawned = spawn_instance(&shell(&dir, "sleep 5"), 0, 1).unwrap();

        let pgid = nix::unistd::getpgid(Some(nix::unistd::Pid::from_raw(spawned.pid as i32)))
            .unwrap();
        assert_eq!(pgid.as_raw(), spawned.pid as i32);

        spawned.child.kill().await.unwrap();
    }
}
