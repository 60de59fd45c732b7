//! Simulated testbed entry point
//!
//! Boots a fleet of simulated nodes behind an in-process gateway, hands
//! the gateway to a fleet controller, and runs one CLI command against
//! it. Without a command it monitors fleet events until interrupted.

mod commands;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use formic_controller::Controller;
use formic_sim::{load_settings, SimGateway, SimNode};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use commands::Command;

#[derive(Parser, Debug)]
#[command(name = "formic-sim")]
#[command(about = "Simulated robot testbed driven by the formic fleet controller")]
#[command(version)]
struct Args {
    /// Path to settings file
    #[arg(short, long, default_value = "formic-sim.toml")]
    config: PathBuf,

    /// Frame loss probability, overriding the settings file
    #[arg(long)]
    loss: Option<f64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Print reports as JSON instead of tables
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("formic-sim v{}", env!("CARGO_PKG_VERSION"));

    let mut settings = load_settings(&args.config)?;
    if let Some(loss) = args.loss {
        settings.gateway.loss = loss;
    }

    let gateway = SimGateway::with_loss(settings.gateway.loss);
    let nodes: Vec<_> = settings
        .nodes
        .iter()
        .map(|node| SimNode::spawn(&gateway, node.node_config()))
        .collect();
    info!(nodes = nodes.len(), loss = settings.gateway.loss, "Fleet up");

    let controller = Controller::new(gateway.clone(), settings.controller.clone())?;

    // Let the first announcements land before acting on the fleet.
    controller.status(Some(Duration::from_millis(300))).await?;

    let command = args.command.unwrap_or(Command::Monitor { duration_secs: None });
    let result = commands::run(&controller, &settings, command, args.json).await;

    controller.terminate().await;
    for node in &nodes {
        node.shutdown();
    }
    result
}
