// Daemon - Wires the supervisor, the control socket and OS signals together

use crate::config::{load_specs, SpecDefaults, SupervisorSettings};
use crate::error::{CorralError, Result};
use crate::ipc::{Command, IpcServer, ResponseData, StartReport};
use crate::process::{ReloadReport, Supervisor, SupervisorEvent, Target};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, Notify};
use tracing::{error, info, warn};

/// Long-running supervisor process answering operator commands on a Unix socket
pub struct Daemon {
    settings: SupervisorSettings,
    context: Arc<Context>,
    server: Option<IpcServer>,
}

/// State shared by every command handler
struct Context {
    supervisor: Arc<Supervisor>,
    spec_defaults: SpecDefaults,
    started: Instant,
    shutdown: Notify,
}

impl Daemon {
    /// Must be called inside a tokio runtime
    pub fn new(settings: SupervisorSettings) -> Self {
        let supervisor = Supervisor::new(settings.supervisor_options());
        let context = Arc::new(Context {
            supervisor,
            spec_defaults: settings.spec_defaults(),
            started: Instant::now(),
            shutdown: Notify::new(),
        });
        Self {
            settings,
            context,
            server: None,
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.context.supervisor
    }

    /// Replace the registry with the apps of an ecosystem file and start them
    pub async fn load_ecosystem(&self, path: &Path) -> Result<ReloadReport> {
        self.context.reload(path).await
    }

    /// Answer a single operator command
    pub async fn handle_command(&self, command: Command) -> Result<ResponseData> {
        self.context.handle(command).await
    }

    /// Claim the control socket; fails when another daemon already answers on it
    pub async fn bind(&mut self) -> Result<()> {
        if self.server.is_some() {
            return Ok(());
        }
        let mut server = IpcServer::with_socket_path(&self.settings.socket_path);
        server.start().await?;
        self.server = Some(server);
        Ok(())
    }

    /// Serve the control socket until SIGTERM, SIGINT or a `Shutdown` command, then stop every
    /// instance gracefully
    ///
    /// Binds first when [`Daemon::bind`] was not called. If the socket cannot be claimed, every
    /// instance already running is stopped before the error is returned.
    pub async fn run(mut self) -> Result<()> {
        if let Err(e) = self.bind().await {
            error!(error = %e, "Control socket unavailable, stopping instances");
            self.context.supervisor.shutdown().await;
            return Err(e);
        }
        let Some(server) = self.server.take() else {
            return Err(CorralError::Ipc("Server not started".to_string()));
        };

        let events = tokio::spawn(log_events(self.context.supervisor.subscribe()));

        let context = Arc::clone(&self.context);
        let server_task = tokio::spawn(async move {
            let result = server
                .run(move |command| {
                    let context = Arc::clone(&context);
                    async move { context.handle(command).await }
                })
                .await;
            if let Err(e) = result {
                error!(error = %e, "Control socket failed");
            }
        });

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        info!(pid = std::process::id(), "Daemon started");

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
            _ = self.context.shutdown.notified() => info!("Shutdown requested"),
        }

        // Dropping the server removes the socket file
        server_task.abort();
        let _ = server_task.await;

        self.context.supervisor.shutdown().await;
        events.abort();

        info!("Daemon stopped");
        Ok(())
    }
}

impl Context {
    async fn handle(&self, command: Command) -> Result<ResponseData> {
        let supervisor = &self.supervisor;

        match command {
            Command::Start { target } => {
                let target = Target::parse(target.as_deref());
                let summary = supervisor.start(&target).await?;
                Ok(ResponseData::Started(StartReport::from(summary)))
            }

            Command::Stop { target, force } => {
                let target = Target::parse(target.as_deref());
                let summary = supervisor.stop(&target, !force).await?;
                Ok(ResponseData::Stopped {
                    instances: summary.stopped.iter().map(ToString::to_string).collect(),
                    failed: summary
                        .failed
                        .into_iter()
                        .map(|(id, error)| (id.to_string(), error))
                        .collect(),
                })
            }

            Command::Restart { target } => {
                let target = Target::parse(target.as_deref());
                let restarted = supervisor.restart(&target).await?;
                Ok(ResponseData::Restarted {
                    instances: restarted.iter().map(ToString::to_string).collect(),
                })
            }

            Command::Reload { config_path } => {
                let report = self.reload(&config_path).await?;
                Ok(ResponseData::Reloaded(report))
            }

            Command::Status => Ok(ResponseData::Status(supervisor.status().await)),

            Command::Ping => Ok(ResponseData::Pong {
                version: env!("CARGO_PKG_VERSION").to_string(),
                pid: std::process::id(),
                uptime_secs: self.started.elapsed().as_secs(),
            }),

            Command::Shutdown => {
                self.shutdown.notify_one();
                Ok(ResponseData::ShuttingDown)
            }
        }
    }

    async fn reload(&self, path: &Path) -> Result<ReloadReport> {
        if path.is_relative() {
            return Err(CorralError::Config(format!(
                "Ecosystem path must be absolute: {}",
                path.display()
            )));
        }
        let specs = load_specs(path, &self.spec_defaults)?;
        let report = self.supervisor.reload(specs).await?;

        for (instance, reason) in &report.failed {
            warn!(instance = %instance, reason = %reason, "Reload left an instance down");
        }
        Ok(report)
    }
}

async fn log_events(mut events: broadcast::Receiver<SupervisorEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Event log fell behind");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        match event {
            SupervisorEvent::Started { id, pid } => info!(instance = %id, pid, "Instance online"),
            SupervisorEvent::LaunchFailed { id, error } => {
                error!(instance = %id, error = %error, "Instance failed to launch")
            }
            SupervisorEvent::Exited { id, cause } => {
                warn!(instance = %id, cause = %cause, "Instance exited")
            }
            SupervisorEvent::Stopped { id } => info!(instance = %id, "Instance stopped"),
            SupervisorEvent::RestartScheduled { id, delay } => {
                info!(instance = %id, delay_ms = delay.as_millis() as u64, "Restart scheduled")
            }
            SupervisorEvent::CrashLoop { id, exits } => {
                error!(instance = %id, exits, "Crash loop detected, giving up")
            }
            SupervisorEvent::MemoryLimitExceeded { id, usage, limit } => {
                warn!(instance = %id, usage, limit, "Memory limit exceeded")
            }
            SupervisorEvent::Reloaded { generation } => info!(generation, "Apps reloaded"),
        }
    }
}
