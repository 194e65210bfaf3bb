//! Command-line interface for `ha-node`
//!
//! - Run an in-process multi-node simulation
//! - Print or write the default configuration
//! - Validate a configuration file

use crate::config::{HaConfig, SeedNode};
use crate::error::HaError;
use crate::logging;
use crate::node::{HaNode, HaSnapshot};
use crate::transport::InMemoryNetwork;
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "ha-node", author, version, about, long_about = None)]
pub struct Cli {
    /// Override the configured log level
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run several nodes on an in-memory network and print the leader's snapshot
    Simulate {
        #[arg(long, default_value_t = 3)]
        nodes: usize,

        #[arg(long, default_value_t = 15)]
        duration_secs: u64,

        /// Component to report as failed on the first node (repeatable)
        #[arg(long = "fail", value_name = "COMPONENT")]
        fail: Vec<String>,

        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the default configuration, or write it to a file
    Config {
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Load and validate a configuration file
    Validate {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub nodes: usize,
    pub duration: Duration,
    pub failures: Vec<String>,
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Simulate {
            nodes,
            duration_secs,
            fail,
            config,
        } => {
            let mut config = match config {
                Some(path) => HaConfig::load(&path)
                    .with_context(|| format!("Failed to load {}", path.display()))?,
                None => HaConfig::discover()?,
            };
            if let Some(level) = cli.log_level {
                config.logging.level = level;
            }
            let log_maintenance = logging::init(&config.logging)?;

            let options = SimulationOptions {
                nodes,
                duration: Duration::from_secs(duration_secs),
                failures: fail,
            };
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "Failed to listen for ctrl-c");
                    std::future::pending::<()>().await;
                }
                info!("Interrupted, stopping simulation");
            };

            let snapshot = simulate(&config, &options, shutdown).await;
            log_maintenance.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&snapshot?)?);
        }
        Commands::Config { output } => {
            let config = HaConfig::default();
            match output {
                Some(path) => {
                    config.save(&path)?;
                    println!("Configuration written to {}", path.display());
                }
                None => print!("{}", config.to_yaml()?),
            }
        }
        Commands::Validate { config } => {
            let loaded = HaConfig::load(&config)
                .with_context(|| format!("Failed to load {}", config.display()))?;
            loaded.validate()?;
            println!("{} is valid", config.display());
        }
    }
    Ok(())
}

/// Build `options.nodes` nodes from `base`, seed each with its predecessor,
/// run them until `options.duration` passes or `shutdown` resolves, then
/// return the leader's snapshot (or the first node's if nobody leads).
pub async fn simulate<F>(
    base: &HaConfig,
    options: &SimulationOptions,
    shutdown: F,
) -> Result<HaSnapshot, HaError>
where
    F: Future<Output = ()>,
{
    if options.nodes == 0 {
        return Err(HaError::config("Simulation needs at least one node"));
    }

    let network = InMemoryNetwork::new();
    let mut nodes = Vec::with_capacity(options.nodes);
    for index in 0..options.nodes {
        let mut config = base.clone();
        config.node.node_id = format!("node-{}", index + 1);
        config.node.port = base.node.port.saturating_add(index as u16);
        config.node.seeds = match index {
            0 => Vec::new(),
            _ => vec![SeedNode {
                node_id: format!("node-{}", index),
                hostname: base.node.hostname.clone(),
                port: base.node.port.saturating_add(index as u16 - 1),
            }],
        };

        let node = HaNode::new(config, network.clone())?;
        network.attach(node.cluster());
        nodes.push(node);
    }

    for node in &nodes {
        node.start().await?;
    }
    info!(nodes = nodes.len(), "Simulation running");

    for component in &options.failures {
        nodes[0]
            .failover()
            .on_component_failure(component, component, "injected failure");
    }

    tokio::select! {
        _ = tokio::time::sleep(options.duration) => {}
        _ = shutdown => {}
    }

    let reporter = nodes
        .iter()
        .find(|node| node.cluster().is_leader())
        .unwrap_or(&nodes[0]);
    let snapshot = reporter.snapshot();

    for node in nodes.iter().rev() {
        if let Err(e) = node.stop().await {
            warn!(node_id = %node.node_id(), error = %e, "Node failed to stop cleanly");
        }
    }
    info!(
        delivered = network.delivered(),
        dropped = network.dropped(),
        "Simulation finished"
    );

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::NodeRole;
    use clap::CommandFactory;

    fn fast_config() -> HaConfig {
        let mut config = HaConfig::default();
        config.cluster.gossip_interval_ms = 20;
        config.cluster.election_timeout_min_ms = 60;
        config.cluster.election_timeout_max_ms = 120;
        config.cluster.heartbeat_timeout_ms = 20;
        config.cluster.election_check_interval_ms = 10;
        config
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();

        let cli = Cli::parse_from([
            "ha-node", "simulate", "--nodes", "5", "--fail", "db", "--fail", "cache",
        ]);
        match cli.command {
            Commands::Simulate { nodes, fail, .. } => {
                assert_eq!(nodes, 5);
                assert_eq!(fail, vec!["db", "cache"]);
            }
            _ => panic!("expected simulate"),
        }
    }

    #[tokio::test]
    async fn test_simulation_elects_a_leader() {
        let options = SimulationOptions {
            nodes: 3,
            duration: Duration::from_millis(1500),
            failures: vec!["db".to_string()],
        };
        let snapshot = simulate(&fast_config(), &options, std::future::pending())
            .await
            .unwrap();

        assert_eq!(snapshot.cluster.role, NodeRole::Leader);
        assert_eq!(snapshot.cluster.nodes.len(), 3);
    }

    #[tokio::test]
    async fn test_simulation_stops_on_shutdown() {
        let options = SimulationOptions {
            nodes: 1,
            duration: Duration::from_secs(3600),
            failures: Vec::new(),
        };
        let snapshot = tokio::time::timeout(
            Duration::from_secs(5),
            simulate(&fast_config(), &options, async {}),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(snapshot.cluster.node_id, "node-1");
    }

    #[tokio::test]
    async fn test_zero_nodes_rejected() {
        let options = SimulationOptions {
            nodes: 0,
            duration: Duration::from_millis(10),
            failures: Vec::new(),
        };
        assert!(simulate(&fast_config(), &options, async {}).await.is_err());
    }
}
