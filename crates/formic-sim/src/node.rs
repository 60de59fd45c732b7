//! Simulated testbed node
//!
//! A [`SimNode`] behaves like device firmware on the other side of the
//! gateway: it announces its status periodically and on every transition,
//! honors start/stop/reset against the same status rules real nodes
//! enforce, accepts user messages only while running, and reassembles OTA
//! images chunk by chunk with an end-to-end digest check. Fault knobs on
//! [`NodeConfig`] make it misbehave in controlled ways for tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use formic_core::{DeviceAddress, DeviceStatus, DeviceType, Packet, Position};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, trace, warn};

use crate::gateway::{NodeLink, SimGateway};

/// Swallow the first `count` acknowledgments for chunk `index`.
#[derive(Debug, Clone, Copy)]
pub struct DropChunkAcks {
    pub index: u32,
    pub count: u32,
}

/// Static shape and fault profile of one simulated node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub address: DeviceAddress,
    pub device_type: DeviceType,
    /// Assigned position; reset sends the node back here.
    pub position: Position,
    pub battery_millivolts: u16,
    pub announce_period: Duration,
    /// Never answer an OTA start announcement.
    pub refuse_ota_start: bool,
    /// Store chunks but suppress some of their acknowledgments.
    pub drop_chunk_acks: Option<DropChunkAcks>,
    /// Corrupt this chunk while storing it, so the final digests differ.
    pub corrupt_chunk: Option<u32>,
}

impl NodeConfig {
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            device_type: DeviceType::DotBot,
            position: Position::default(),
            battery_millivolts: 3700,
            announce_period: Duration::from_millis(100),
            refuse_ota_start: false,
            drop_chunk_acks: None,
            corrupt_chunk: None,
        }
    }
}

/// Handle onto a spawned node, for scripting it from tests.
pub struct NodeHandle {
    address: DeviceAddress,
    muted: Arc<AtomicBool>,
    messages: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl NodeHandle {
    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    /// Silence or revive the node. A muted node keeps processing inbound
    /// frames but emits nothing, like a device with a dead transmitter.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    /// Messages the node accepted while running.
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    /// Stop the node task.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

struct OtaSession {
    fw_length: u32,
    chunk_count: u32,
    sha256: [u8; 32],
    chunks: BTreeMap<u32, Vec<u8>>,
}

impl OtaSession {
    fn is_complete(&self) -> bool {
        self.chunks.len() as u32 == self.chunk_count
    }

    fn digest_matches(&self) -> bool {
        let mut hasher = Sha256::new();
        let mut total = 0usize;
        for chunk in self.chunks.values() {
            hasher.update(chunk);
            total += chunk.len();
        }
        let digest: [u8; 32] = hasher.finalize().into();
        total as u32 == self.fw_length && digest == self.sha256
    }
}

/// One simulated device, driven as a background task.
pub struct SimNode {
    link: NodeLink,
    config: NodeConfig,
    status: DeviceStatus,
    position: Position,
    muted: Arc<AtomicBool>,
    messages: Arc<Mutex<Vec<String>>>,
    ota: Option<OtaSession>,
    ack_drop_budget: u32,
}

impl SimNode {
    /// Attach a node to `gateway` and run it until shut down.
    pub fn spawn(gateway: &SimGateway, config: NodeConfig) -> NodeHandle {
        let link = gateway.attach_node(config.address);
        let muted = Arc::new(AtomicBool::new(false));
        let messages = Arc::new(Mutex::new(Vec::new()));
        let node = SimNode {
            link,
            status: DeviceStatus::Bootloader,
            position: config.position,
            muted: Arc::clone(&muted),
            messages: Arc::clone(&messages),
            ota: None,
            ack_drop_budget: config.drop_chunk_acks.map(|drop| drop.count).unwrap_or(0),
            config: config.clone(),
        };
        NodeHandle {
            address: config.address,
            muted,
            messages,
            task: tokio::spawn(node.run()),
        }
    }

    async fn run(mut self) {
        let mut announce = time::interval(self.config.announce_period);
        announce.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            let frame = tokio::select! {
                frame = self.link.recv() => match frame {
                    Some(payload) => Some(payload),
                    // Link torn down.
                    None => break,
                },
                _ = announce.tick() => None,
            };
            match frame {
                Some(payload) => self.on_frame(&payload),
                None => self.announce(),
            }
        }
        trace!(device = %self.config.address, "Node loop ended");
    }

    fn on_frame(&mut self, payload: &[u8]) {
        let packet = match Packet::decode(payload) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(device = %self.config.address, error = %err, "Node dropped malformed frame");
                return;
            }
        };
        match packet {
            Packet::StatusRequest { .. } => self.announce(),
            Packet::StartRequest { .. } => {
                if self.status == DeviceStatus::Bootloader {
                    self.set_status(DeviceStatus::Running);
                }
            }
            Packet::StopRequest { .. } => {
                if matches!(self.status, DeviceStatus::Running | DeviceStatus::Resetting) {
                    self.set_status(DeviceStatus::Bootloader);
                }
            }
            Packet::ResetRequest { position, .. } => {
                // Only a bootloader node takes a reset; it heads to the
                // given spot and reports Resetting until stopped.
                if self.status == DeviceStatus::Bootloader {
                    self.position = position;
                    self.set_status(DeviceStatus::Resetting);
                }
            }
            Packet::MessageRequest { message, .. } => {
                if self.status == DeviceStatus::Running {
                    let text = String::from_utf8_lossy(&message).into_owned();
                    debug!(device = %self.config.address, text = %text, "Message accepted");
                    self.messages.lock().unwrap().push(text);
                }
            }
            Packet::OtaStartRequest {
                fw_length,
                chunk_count,
                sha256,
                ..
            } => self.on_ota_start(fw_length, chunk_count, sha256),
            Packet::OtaChunkRequest { index, data, .. } => self.on_ota_chunk(index, data),
            _ => trace!(device = %self.config.address, "Node ignoring frame"),
        }
    }

    fn set_status(&mut self, status: DeviceStatus) {
        debug!(device = %self.config.address, from = %self.status, to = %status, "Node transition");
        self.status = status;
        if status != DeviceStatus::Bootloader {
            // Leaving the bootloader abandons any half-done update.
            self.ota = None;
        }
        // Nodes announce transitions right away rather than waiting for
        // the next periodic beacon.
        self.announce();
    }

    fn announce(&self) {
        self.emit(&Packet::StatusNotification {
            device_id: self.config.address,
            status: self.status,
            battery_millivolts: self.config.battery_millivolts,
            device_type: self.config.device_type,
            position: self.position,
        });
    }

    fn on_ota_start(&mut self, fw_length: u32, chunk_count: u32, sha256: [u8; 32]) {
        if self.config.refuse_ota_start {
            debug!(device = %self.config.address, "Refusing OTA start");
            return;
        }
        if self.status != DeviceStatus::Bootloader {
            return;
        }
        self.ota = Some(OtaSession {
            fw_length,
            chunk_count,
            sha256,
            chunks: BTreeMap::new(),
        });
        debug!(device = %self.config.address, chunks = chunk_count, bytes = fw_length, "OTA session opened");
        self.emit(&Packet::OtaStartAck {
            device_id: self.config.address,
        });
    }

    fn on_ota_chunk(&mut self, index: u32, data: Vec<u8>) {
        let corrupt = self.config.corrupt_chunk == Some(index);
        let hashes_match = {
            let Some(session) = self.ota.as_mut() else {
                trace!(device = %self.config.address, chunk = index, "Chunk without an OTA session");
                return;
            };
            if index >= session.chunk_count {
                warn!(device = %self.config.address, chunk = index, "Chunk index out of range");
                return;
            }
            let mut stored = data;
            if corrupt {
                if let Some(byte) = stored.first_mut() {
                    *byte ^= 0xFF;
                }
            }
            session.chunks.insert(index, stored);
            session.is_complete() && session.digest_matches()
        };

        if let Some(drop) = self.config.drop_chunk_acks {
            if drop.index == index && self.ack_drop_budget > 0 {
                self.ack_drop_budget -= 1;
                debug!(device = %self.config.address, chunk = index, left = self.ack_drop_budget, "Swallowing chunk ack");
                return;
            }
        }
        self.emit(&Packet::OtaChunkAck {
            device_id: self.config.address,
            index,
            hashes_match,
        });
    }

    fn emit(&self, packet: &Packet) {
        if self.muted.load(Ordering::SeqCst) {
            return;
        }
        self.link.emit(packet);
    }
}

#[cfg(test)]
mod tests {
    use formic_controller::{GatewayAdapter, LinkEvent};
    use formic_core::FirmwareImage;
    use tokio::sync::mpsc;

    use super::*;

    async fn next_status(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> DeviceStatus {
        loop {
            let event = time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("no link event within 1s")
                .expect("link event channel closed");
            if let LinkEvent::Frame { payload, .. } = event {
                if let Ok(Packet::StatusNotification { status, .. }) = Packet::decode(&payload) {
                    return status;
                }
            }
        }
    }

    async fn next_packet(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> Packet {
        loop {
            let event = time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("no link event within 1s")
                .expect("link event channel closed");
            if let LinkEvent::Frame { payload, .. } = event {
                return Packet::decode(&payload).expect("node emitted an undecodable frame");
            }
        }
    }

    #[tokio::test]
    async fn test_node_announces_bootloader_then_starts() {
        let mut gateway = SimGateway::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        gateway.init(tx).unwrap();
        let address = DeviceAddress(0x21);
        let _node = SimNode::spawn(&gateway, NodeConfig::new(address));

        assert_eq!(next_status(&mut rx).await, DeviceStatus::Bootloader);

        gateway
            .send(&Packet::StartRequest { device_id: address }.encode())
            .unwrap();
        loop {
            if next_status(&mut rx).await == DeviceStatus::Running {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_running_node_ignores_reset() {
        let mut gateway = SimGateway::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        gateway.init(tx).unwrap();
        let address = DeviceAddress(0x22);
        let _node = SimNode::spawn(&gateway, NodeConfig::new(address));

        gateway
            .send(&Packet::StartRequest { device_id: address }.encode())
            .unwrap();
        loop {
            if next_status(&mut rx).await == DeviceStatus::Running {
                break;
            }
        }

        gateway
            .send(
                &Packet::ResetRequest {
                    device_id: address,
                    position: Position::new(7, 7),
                }
                .encode(),
            )
            .unwrap();
        // Still announcing Running afterwards.
        assert_eq!(next_status(&mut rx).await, DeviceStatus::Running);
    }

    #[tokio::test]
    async fn test_node_reassembles_image_and_compares_digest() {
        let mut gateway = SimGateway::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        gateway.init(tx).unwrap();
        let address = DeviceAddress(0x23);
        let mut config = NodeConfig::new(address);
        config.announce_period = Duration::from_secs(60); // keep the stream quiet
        let _node = SimNode::spawn(&gateway, config);

        let image = FirmwareImage::new(vec![0x5A; 200]).unwrap();
        gateway
            .send(
                &Packet::OtaStartRequest {
                    device_id: address,
                    fw_length: image.len(),
                    chunk_count: image.chunk_count(),
                    sha256: *image.sha256(),
                }
                .encode(),
            )
            .unwrap();
        loop {
            if matches!(next_packet(&mut rx).await, Packet::OtaStartAck { .. }) {
                break;
            }
        }

        for (index, data) in image.chunks() {
            gateway
                .send(
                    &Packet::OtaChunkRequest {
                        device_id: address,
                        index,
                        data: data.to_vec(),
                    }
                    .encode(),
                )
                .unwrap();
            loop {
                match next_packet(&mut rx).await {
                    Packet::OtaChunkAck { index: acked, hashes_match, .. } if acked == index => {
                        let is_last = index + 1 == image.chunk_count();
                        assert_eq!(hashes_match, is_last);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}
