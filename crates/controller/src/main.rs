use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use trellis_controller::bootstrap;
use trellis_controller::cli::{agent, AgentCommand, Cli, ClusterCommand, Command, ControllerCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Version) => {
            println!("trellis {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Command::Run { config }) => {
            init_tracing();
            let config = Arc::new(load_and_check(&config)?);
            bootstrap::run_server(config).await
        }
        Some(Command::Agent { command }) => {
            init_tracing();
            match command {
                AgentCommand::Cluster { command, config } => {
                    let config = Arc::new(load_and_check(&config)?);
                    match command {
                        ClusterCommand::Init => agent::cluster_init(&config),
                        ClusterCommand::ListMembers => agent::cluster_list_members(&config),
                        ClusterCommand::Add { address } => {
                            agent::cluster_membership_unavailable(&format!("add peer {address}"))
                        }
                        ClusterCommand::Remove { id } => {
                            agent::cluster_membership_unavailable(&format!("remove peer {id}"))
                        }
                        ClusterCommand::TransferLeadership { id } => {
                            let target = id.unwrap_or_else(|| "any member".into());
                            agent::cluster_membership_unavailable(&format!(
                                "transfer leadership to {target}"
                            ))
                        }
                        ClusterCommand::InitFromDb { path } => {
                            agent::init_from_db(config, &path).await
                        }
                    }
                }
                AgentCommand::Controller { command, config } => {
                    let config = Arc::new(load_and_check(&config)?);
                    match command {
                        ControllerCommand::InitFromDb { path } => {
                            agent::init_from_db(config, &path).await
                        }
                    }
                }
            }
        }
    }
}

fn load_and_check(path: &std::path::Path) -> anyhow::Result<trellis_domain::config::Config> {
    use trellis_domain::config::ConfigSeverity;

    let config = trellis_controller::cli::load_config(path)?;
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    let errors = issues
        .iter()
        .filter(|i| i.severity == ConfigSeverity::Error)
        .count();
    if errors > 0 {
        anyhow::bail!("config validation failed with {errors} error(s)");
    }
    Ok(config)
}

/// Structured tracing to stderr; `RUST_LOG` overrides the default.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,trellis_controller=debug")),
        )
        .with_writer(std::io::stderr)
        .init();
}
