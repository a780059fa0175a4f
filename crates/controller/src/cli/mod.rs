//! Command-line interface.

pub mod agent;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use trellis_domain::config::Config;

#[derive(Parser)]
#[command(name = "trellis", about = "trellis overlay network controller")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the controller.
    Run {
        /// Path to the controller config file (TOML).
        config: PathBuf,
    },
    /// Operational tooling against controller state.
    Agent {
        #[command(subcommand)]
        command: AgentCommand,
    },
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
pub enum AgentCommand {
    /// Cluster membership operations.
    Cluster {
        #[command(subcommand)]
        command: ClusterCommand,
        /// Controller config file.
        #[arg(long, default_value = "trellis.toml")]
        config: PathBuf,
    },
    /// Controller-local operations.
    Controller {
        #[command(subcommand)]
        command: ControllerCommand,
        #[arg(long, default_value = "trellis.toml")]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
pub enum ClusterCommand {
    /// Initialize a single-node cluster.
    Init,
    /// Add a peer to the cluster.
    Add { address: String },
    /// Remove a peer from the cluster.
    Remove { id: String },
    /// List cluster members.
    ListMembers,
    /// Hand leadership to another member.
    TransferLeadership { id: Option<String> },
    /// Initialize cluster state from a legacy store file.
    InitFromDb { path: PathBuf },
}

#[derive(Subcommand)]
pub enum ControllerCommand {
    /// Initialize the controller store from a legacy store file.
    InitFromDb { path: PathBuf },
}

/// Load and validate a TOML config file.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| anyhow::anyhow!("could not read config {}: {err}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .map_err(|err| anyhow::anyhow!("could not parse config {}: {err}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_and_agent_forms() {
        let cli = Cli::parse_from(["trellis", "run", "ctrl.toml"]);
        assert!(matches!(cli.command, Some(Command::Run { .. })));

        let cli = Cli::parse_from([
            "trellis", "agent", "controller", "--config", "c.toml", "init-from-db", "old.db",
        ]);
        match cli.command {
            Some(Command::Agent {
                command:
                    AgentCommand::Controller {
                        command: ControllerCommand::InitFromDb { path },
                        ..
                    },
            }) => assert_eq!(path, PathBuf::from("old.db")),
            _ => panic!("unexpected parse"),
        }

        let cli = Cli::parse_from(["trellis", "agent", "cluster", "list-members"]);
        assert!(matches!(
            cli.command,
            Some(Command::Agent {
                command: AgentCommand::Cluster {
                    command: ClusterCommand::ListMembers,
                    ..
                }
            })
        ));
    }
}
