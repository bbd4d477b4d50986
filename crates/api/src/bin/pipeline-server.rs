//! Pipeline server entry point
//!
//! Loads configuration, builds the orchestrator and serves the pipeline API.

use analytics_api::ApiServer;
use analytics_common::SystemConfig;
use analytics_pipeline::DependencyGraph;
use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "pipeline-server")]
#[command(version = "0.1.0")]
#[command(about = "Agent pipeline orchestrator for dataset analysis")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "PIPELINE_CONFIG", default_value = "pipeline.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "RUST_LOG")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server (default)
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(long)]
        port: Option<u16>,
    },
    /// Validate configuration and the agent graph
    ValidateConfig {
        /// Print the agent graph in Graphviz DOT format
        #[arg(long)]
        dot: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = cli.log_level.as_deref().unwrap_or("info");
    analytics_common::init_tracing_with_level(log_level)?;

    let config = SystemConfig::from_file(&cli.config).map_err(|e| {
        error!(path = %cli.config, "Failed to load configuration: {}", e);
        e
    })?;
    info!(path = %cli.config, agents = config.agents.len(), "Configuration loaded");

    match cli.command {
        Some(Commands::ValidateConfig { dot }) => validate(&config, dot),
        Some(Commands::Serve { host, port }) => {
            let mut config = config;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            ApiServer::new(config)?.run().await
        }
        None => ApiServer::new(config)?.run().await,
    }
}

fn validate(config: &SystemConfig, dot: bool) -> Result<()> {
    let graph = DependencyGraph::from_config(&config.pipeline.graph)?;
    let missing: Vec<&str> = graph
        .agents()
        .iter()
        .filter(|agent| !config.agents.contains_key(*agent))
        .map(|agent| agent.name())
        .collect();
    let unused: Vec<&str> = config
        .agents
        .keys()
        .filter(|agent| !graph.contains(**agent))
        .map(|agent| agent.name())
        .collect();

    println!("✓ Configuration is valid");
    println!("  Agents: {}", graph.node_count());
    for agent in graph.agents() {
        let endpoint = config
            .agents
            .get(agent)
            .map(|e| e.endpoint.as_str())
            .unwrap_or("-");
        println!("    {:<20} {}", agent.display_name(), endpoint);
    }
    println!("  Edges: {}", graph.edge_count());
    println!(
        "  Entry: {:?}",
        graph.roots().iter().map(|a| a.name()).collect::<Vec<_>>()
    );
    println!(
        "  Fork: {} -> {:?} -> {}",
        graph.fork().gate,
        graph.fork().branches.iter().map(|b| b.name()).collect::<Vec<_>>(),
        graph.fork().join
    );
    println!("  Default route: {}", config.pipeline.default_route);
    if !unused.is_empty() {
        warn!(agents = ?unused, "Endpoints configured for agents outside the graph");
    }
    if dot {
        println!();
        println!("{}", graph.to_dot());
    }

    if !missing.is_empty() {
        anyhow::bail!("no endpoint configured for agents: {}", missing.join(", "));
    }
    Ok(())
}
