// CLI module - Operator commands sent to the daemon

mod output;

pub use output::print_error;

use crate::config::DEFAULT_SOCKET_PATH;
use crate::error::{CorralError, Result};
use crate::ipc::{Command, IpcClient};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// corral - a process supervisor for long-running apps
#[derive(Debug, Parser)]
#[command(name = "corral")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Control socket of the daemon
    #[arg(long, global = true, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start an app, an instance (name#n) or everything
    Start { target: Option<String> },

    /// Stop an app, an instance (name#n) or everything
    Stop {
        target: Option<String>,

        /// Kill immediately with SIGKILL instead of waiting for a graceful exit
        #[arg(short, long)]
        force: bool,
    },

    /// Restart an app, an instance (name#n) or everything
    Restart { target: Option<String> },

    /// Load an ecosystem file, reconciling running apps with it
    Reload { config: PathBuf },

    /// Show every instance
    #[command(alias = "list", alias = "ls")]
    Status,

    /// Check that the daemon is alive
    Ping,

    /// Stop every app and shut the daemon down
    Kill,
}

impl Cli {
    /// Run the CLI application
    pub fn run() -> Result<()> {
        let cli = Cli::parse();
        cli.execute()
    }

    fn execute(&self) -> Result<()> {
        let command = self.build_command()?;
        let client = IpcClient::with_socket_path(&self.socket);

        let data = client.call(command)?;
        output::print_success(&data);
        Ok(())
    }

    /// Build an IPC command from the CLI arguments
    fn build_command(&self) -> Result<Command> {
        let command = match &self.command {
            Commands::Start { target } => Command::Start {
                target: target.clone(),
            },
            Commands::Stop { target, force } => Command::Stop {
                target: target.clone(),
                force: *force,
            },
            Commands::Restart { target } => Command::Restart {
                target: target.clone(),
            },
            // The daemon may run in another directory
            Commands::Reload { config } => Command::Reload {
                config_path: std::path::absolute(config).map_err(|e| {
                    CorralError::Config(format!("Cannot resolve {}: {}", config.display(), e))
                })?,
            },
            Commands::Status => Command::Status,
            Commands::Ping => Command::Ping,
            Commands::Kill => Command::Shutdown,
        };
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(args: &[&str]) -> Command {
        let cli = Cli::try_parse_from(std::iter::once("corral").chain(args.iter().copied())).unwrap();
        cli.build_command().unwrap()
    }

    #[test]
    fn test_target_defaults_to_all() {
        assert_eq!(command(&["start"]), Command::Start { target: None });
        assert_eq!(command(&["restart"]), Command::Restart { target: None });
    }

    #[test]
    fn test_stop_instance_with_force() {
        assert_eq!(
            command(&["stop", "web#2", "--force"]),
            Command::Stop {
                target: Some("web#2".to_string()),
                force: true
            }
        );
    }

    #[test]
    fn test_reload_path_is_made_absolute() {
        match command(&["reload", "ecosystem.json"]) {
            Command::Reload { config_path } => {
                assert!(config_path.is_absolute());
                assert!(config_path.ends_with("ecosystem.json"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_aliases_and_socket() {
        let cli = Cli::try_parse_from(["corral", "ls", "--socket", "/run/c.sock"]).unwrap();
        assert_eq!(cli.socket, PathBuf::from("/run/c.sock"));
        assert_eq!(cli.build_command().unwrap(), Command::Status);
        assert_eq!(command(&["kill"]), Command::Shutdown);
    }
}
