use anyhow::Context;
use clap::Parser;
use corral::config::SupervisorSettings;
use corral::daemon::Daemon;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// corrald - supervisor daemon for the corral process manager
#[derive(Parser)]
#[command(name = "corrald")]
#[command(version, about, long_about = None)]
struct Args {
    /// Daemon settings file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Ecosystem file whose apps are started on boot
    #[arg(short, long)]
    ecosystem: Option<PathBuf>,

    /// Override the control socket path
    #[arg(short, long)]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut settings = SupervisorSettings::load(args.config.as_deref())
        .context("failed to load daemon settings")?;
    if let Some(socket) = args.socket {
        settings.socket_path = socket;
    }

    let mut daemon = Daemon::new(settings);
    // Claim the socket before any app is launched
    daemon.bind().await.context("failed to bind control socket")?;

    if let Some(ecosystem) = args.ecosystem {
        let path = std::path::absolute(&ecosystem)
            .with_context(|| format!("failed to resolve {}", ecosystem.display()))?;
        let report = match daemon.load_ecosystem(&path).await {
            Ok(report) => report,
            Err(e) => {
                daemon.supervisor().shutdown().await;
                return Err(e).with_context(|| format!("failed to load {}", path.display()));
            }
        };
        tracing::info!(
            apps = report.added.len(),
            failed = report.failed.len(),
            "Ecosystem loaded"
        );
    }

    daemon.run().await?;
    Ok(())
}
