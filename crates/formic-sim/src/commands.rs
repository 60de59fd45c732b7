//! Command implementations for the simulator CLI

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Subcommand;
use formic_controller::{CommandOutcome, Controller};
use formic_core::{DeviceAddress, Position};
use formic_sim::SimSettings;
use tracing::info;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Poll the fleet and print every known device
    Status,
    /// Boot nodes from the bootloader into their application
    Start {
        /// Addresses to start; every eligible node when omitted
        targets: Vec<DeviceAddress>,
    },
    /// Return nodes to the bootloader
    Stop {
        /// Addresses to stop; the whole fleet when omitted
        targets: Vec<DeviceAddress>,
    },
    /// Send bootloader nodes back to their assigned positions
    Reset {
        /// Addresses to reset; every configured node when omitted
        targets: Vec<DeviceAddress>,
    },
    /// Deliver a text message to running applications
    Message {
        /// Message text (at most 255 bytes)
        text: String,
    },
    /// Flash a firmware image onto bootloader nodes
    Flash {
        /// Image file to flash
        #[arg(long)]
        file: Option<PathBuf>,
        /// Synthesize a patterned image of this many bytes instead
        #[arg(long, default_value_t = 4096, conflicts_with = "file")]
        size: u32,
        /// Addresses to flash; every acknowledging node when omitted
        targets: Vec<DeviceAddress>,
    },
    /// Watch fleet events as they happen
    Monitor {
        /// Stop after this many seconds instead of running until Ctrl+C
        #[arg(long)]
        duration_secs: Option<u64>,
    },
}

pub async fn run(
    controller: &Controller,
    settings: &SimSettings,
    command: Command,
    json: bool,
) -> Result<()> {
    match command {
        Command::Status => status(controller, json).await,
        Command::Start { targets } => {
            let outcome = controller.start(optional(targets), None).await?;
            print_outcome("start", &outcome, json)
        }
        Command::Stop { targets } => {
            let outcome = controller.stop(optional(targets), None).await?;
            print_outcome("stop", &outcome, json)
        }
        Command::Reset { targets } => {
            let locations = reset_locations(settings, &targets)?;
            let outcome = controller.reset(&locations, None).await?;
            print_outcome("reset", &outcome, json)
        }
        Command::Message { text } => {
            let outcome = controller.send_message(&text).await?;
            print_outcome("message", &outcome, json)
        }
        Command::Flash { file, size, targets } => {
            flash(controller, file, size, optional(targets), json).await
        }
        Command::Monitor { duration_secs } => {
            let window = duration_secs.map(Duration::from_secs);
            tokio::select! {
                _ = controller.monitor(window) => {}
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            }
            Ok(())
        }
    }
}

fn optional(targets: Vec<DeviceAddress>) -> Option<Vec<DeviceAddress>> {
    if targets.is_empty() {
        None
    } else {
        Some(targets)
    }
}

async fn status(controller: &Controller, json: bool) -> Result<()> {
    let devices = controller.status(None).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }
    println!("{} device(s) known", devices.len());
    for record in devices.values() {
        let position = record
            .position
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        println!(
            "  {}  {:<8} {:<10} {:>5} mV  {}",
            record.address, record.device_type, record.status, record.battery_millivolts, position,
        );
    }
    Ok(())
}

fn print_outcome(command: &str, outcome: &CommandOutcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }
    println!(
        "{}: {} converged, {} missed",
        command,
        outcome.converged.len(),
        outcome.missed.len(),
    );
    for device in &outcome.converged {
        println!("  {device} ok");
    }
    for device in &outcome.missed {
        println!("  {device} missed");
    }
    Ok(())
}

/// Reset destinations come from the settings file, keyed by address.
fn reset_locations(
    settings: &SimSettings,
    targets: &[DeviceAddress],
) -> Result<BTreeMap<DeviceAddress, Position>> {
    let configured: BTreeMap<DeviceAddress, Position> = settings
        .nodes
        .iter()
        .map(|node| (node.address, node.position()))
        .collect();
    if targets.is_empty() {
        return Ok(configured);
    }
    let mut locations = BTreeMap::new();
    for target in targets {
        let position = configured
            .get(target)
            .copied()
            .with_context(|| format!("no configured position for device {target}"))?;
        locations.insert(*target, position);
    }
    Ok(locations)
}

async fn flash(
    controller: &Controller,
    file: Option<PathBuf>,
    size: u32,
    targets: Option<Vec<DeviceAddress>>,
    json: bool,
) -> Result<()> {
    let firmware = match file {
        Some(path) => std::fs::read(&path)
            .with_context(|| format!("reading firmware image {}", path.display()))?,
        None => synthetic_image(size),
    };
    info!(bytes = firmware.len(), "Announcing firmware image");

    let report = controller.start_ota(&firmware, targets).await?;
    if report.acked.is_empty() {
        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            println!("flash: no device acknowledged the announcement");
        }
        return Ok(());
    }

    let outcomes = controller.transfer(&firmware, &report.acked, None, None).await?;
    if json {
        let combined = serde_json::json!({
            "announce": report,
            "transfer": outcomes,
        });
        println!("{}", serde_json::to_string_pretty(&combined)?);
        return Ok(());
    }
    println!("flash: {} chunk(s), sha256 {}", report.chunk_count, report.sha256);
    for device in &report.missed {
        println!("  {device} no answer to announcement");
    }
    for (device, outcome) in &outcomes {
        let verdict = if outcome.success && outcome.hashes_match {
            "flashed and verified"
        } else if outcome.success {
            "flashed but digest mismatch"
        } else {
            "failed"
        };
        println!("  {device} {verdict}");
    }
    Ok(())
}

/// Deterministic filler image for demos without a real firmware file.
fn synthetic_image(size: u32) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}
