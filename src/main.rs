//! safla-node: runs the SAFLA loop against a simulated device farm
//!
//! The farm is seeded from each configured twin's `initial_state`, so a
//! config file alone is enough to watch the loop sense, decide and sync.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use safla_node::config::Config;
use safla_node::persistence;
use safla_node::{Runtime, SimulatedAdapter};

#[derive(Parser)]
#[command(name = "safla-node")]
#[command(about = "SAFLA control loop and digital-twin sync runtime")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "safla-node.toml")]
    config: String,

    /// Node ID (overrides config file)
    #[arg(long, env = "SAFLA_NODE_ID")]
    node_id: Option<String>,

    /// Data directory
    #[arg(short, long, env = "SAFLA_DATA_DIR")]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the node until Ctrl-C (default)
    Run,

    /// Parse and validate the configuration
    Validate,

    /// Print the effective rules and safety constraints
    Rules,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("safla_node=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    if let Some(node_id) = cli.node_id {
        config.node.id = node_id;
    }
    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = PathBuf::from(data_dir);
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Validate => validate(&config),
        Command::Rules => rules(&config),
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!(node_id = %config.node.id, data_dir = %config.node.data_dir.display(), "Starting safla-node");

    let adapter = Arc::new(SimulatedAdapter::new());
    for twin in &config.twins {
        adapter.add_device(&twin.device_id, twin.initial_state.clone());
    }

    let persistence = persistence::open(&config)?;
    let runtime = Runtime::new(config, adapter, persistence)?;
    runtime.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received");

    runtime.shutdown().await?;
    Ok(())
}

fn validate(config: &Config) -> anyhow::Result<()> {
    config.validate()?;
    let rules = config.effective_rules()?;

    println!("Configuration OK");
    println!("  node:        {}", config.node.id);
    println!("  persistence: {:?}", config.persistence.backend);
    println!("  twins:       {}", config.twins.len());
    println!("  rules:       {}", rules.len());
    println!("  constraints: {}", config.constraints.len());
    Ok(())
}

fn rules(config: &Config) -> anyhow::Result<()> {
    let rules = config.effective_rules()?;

    println!("Rules ({}):", rules.len());
    for rule in &rules {
        let state = if rule.enabled { "" } else { " (disabled)" };
        println!(
            "  [{:>3}] {}{} -> {}",
            rule.priority, rule.name, state, rule.action.target
        );
        if !rule.description.is_empty() {
            println!("        {}", rule.description);
        }
    }

    println!("Constraints ({}):", config.constraints.len());
    for constraint in &config.constraints {
        let state = if constraint.enabled { "" } else { " (disabled)" };
        println!("  {:?} {}{}", constraint.severity, constraint.id, state);
        if !constraint.description.is_empty() {
            println!("        {}", constraint.description);
        }
    }
    Ok(())
}
