//! Simulator settings loading

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use formic_controller::ControllerSettings;
use formic_core::{DeviceAddress, DeviceType, Position};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::node::NodeConfig;

/// Top-level settings: the simulated link, the fleet on it, and the
/// controller driving it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimSettings {
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default = "default_nodes", rename = "node")]
    pub nodes: Vec<NodeSettings>,
    #[serde(default)]
    pub controller: ControllerSettings,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            gateway: GatewaySettings::default(),
            nodes: default_nodes(),
            controller: ControllerSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Probability in 0.0..=1.0 that any single frame is lost.
    #[serde(default)]
    pub loss: f64,
}

/// One simulated node on the link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Link address, as canonical hex.
    pub address: DeviceAddress,
    #[serde(default = "default_device_type")]
    pub device_type: DeviceType,
    /// Assigned arena position in micro-units.
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    /// Cadence of unsolicited status announcements.
    #[serde(default = "default_announce_period_ms")]
    pub announce_period_ms: u64,
}

impl NodeSettings {
    pub fn node_config(&self) -> NodeConfig {
        let mut config = NodeConfig::new(self.address);
        config.device_type = self.device_type;
        config.position = Position::new(self.x, self.y);
        config.announce_period = Duration::from_millis(self.announce_period_ms);
        config
    }

    /// Where this node belongs on the arena, for reset commands.
    pub fn position(&self) -> Position {
        Position::new(self.x, self.y)
    }
}

fn default_device_type() -> DeviceType {
    DeviceType::DotBot
}

fn default_announce_period_ms() -> u64 {
    1_000
}

/// A small demo fleet, used when no settings file is present.
fn default_nodes() -> Vec<NodeSettings> {
    (1..=3u32)
        .map(|i| NodeSettings {
            address: DeviceAddress(i),
            device_type: default_device_type(),
            x: i as i32 * 200_000,
            y: 100_000,
            announce_period_ms: default_announce_period_ms(),
        })
        .collect()
}

/// Load settings from `path`, or fall back to the demo fleet when the
/// file does not exist.
pub fn load_settings(path: &Path) -> Result<SimSettings> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let settings: SimSettings = toml::from_str(&content)?;
        info!(path = %path.display(), nodes = settings.nodes.len(), "Loaded settings");
        Ok(settings)
    } else {
        info!(path = %path.display(), "Settings file not found, using demo fleet");
        Ok(SimSettings::default())
    }
}
