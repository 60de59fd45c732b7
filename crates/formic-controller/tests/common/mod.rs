//! Shared harness: a controller wired to simulated nodes over an
//! in-process gateway, with every timeout tightened for tests.
#![allow(dead_code)]

use std::time::Duration;

use formic_controller::{Controller, ControllerSettings};
use formic_core::{DeviceAddress, DeviceStatus, Position};
use formic_sim::{NodeConfig, NodeHandle, SimGateway, SimNode};

pub struct TestBed {
    pub controller: Controller,
    pub nodes: Vec<NodeHandle>,
}

pub fn fast_settings() -> ControllerSettings {
    ControllerSettings {
        devices: Vec::new(),
        command_timeout_ms: 2_000,
        attempt_delay_ms: 50,
        status_timeout_ms: 300,
        chunk_timeout_ms: 200,
        max_chunk_retries: 5,
        inactivity_timeout_ms: 500,
    }
}

/// Node at address `raw`, announcing every 20 ms from its assigned spot.
pub fn fast_node(raw: u32) -> NodeConfig {
    let mut config = NodeConfig::new(DeviceAddress(raw));
    config.announce_period = Duration::from_millis(20);
    config.position = Position::new(raw as i32 * 100_000, 0);
    config
}

impl TestBed {
    /// Fleet of `count` healthy nodes addressed 1..=count.
    pub async fn with_nodes(count: u32) -> Self {
        let configs = (1..=count).map(fast_node).collect();
        Self::with_configs(configs, fast_settings()).await
    }

    pub async fn with_configs(configs: Vec<NodeConfig>, settings: ControllerSettings) -> Self {
        Self::with_gateway(SimGateway::new(), configs, settings).await
    }

    /// Full control over the link, for loss injection. Waits until every
    /// node is known to the controller before returning.
    pub async fn with_gateway(
        gateway: SimGateway,
        configs: Vec<NodeConfig>,
        settings: ControllerSettings,
    ) -> Self {
        let nodes: Vec<NodeHandle> = configs
            .into_iter()
            .map(|config| SimNode::spawn(&gateway, config))
            .collect();
        let controller = Controller::new(gateway, settings).unwrap();
        wait_for_known(&controller, nodes.len()).await;
        Self { controller, nodes }
    }

    pub fn node(&self, raw: u32) -> &NodeHandle {
        self.nodes
            .iter()
            .find(|node| node.address() == DeviceAddress(raw))
            .expect("no node at that address")
    }

    pub async fn teardown(self) {
        self.controller.terminate().await;
        for node in &self.nodes {
            node.shutdown();
        }
    }
}

/// Polls until the registry holds exactly `count` devices.
pub async fn wait_for_known(controller: &Controller, count: usize) {
    for _ in 0..400 {
        if controller.known_devices().await.len() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("registry never reached {count} devices");
}

/// Polls until `device` shows up in the view for `status`.
pub async fn wait_for_status(controller: &Controller, device: DeviceAddress, status: DeviceStatus) {
    for _ in 0..400 {
        let devices = match status {
            DeviceStatus::Bootloader => controller.ready_devices().await,
            DeviceStatus::Running => controller.running_devices().await,
            DeviceStatus::Resetting => controller.resetting_devices().await,
        };
        if devices.contains(&device) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("device {device} never reported {status}");
}
