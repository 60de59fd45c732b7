//! In-process simulated gateway link
//!
//! [`SimGateway`] stands in for the radio gateway: the controller drives
//! it through the adapter trait while simulated nodes attach to it like
//! devices joining the link. Frames are routed by the 4-byte address that
//! leads every encoded packet, with the broadcast address fanning out to
//! every attached node. An optional loss probability drops frames in both
//! directions to exercise the controller's retry paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use formic_controller::{AdapterError, GatewayAdapter, LinkEvent};
use formic_core::{DeviceAddress, Packet};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct Shared {
    /// Events toward the controller; present once the adapter is attached.
    uplink: Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>,
    /// Inbox per attached node for controller-to-device frames.
    nodes: Mutex<HashMap<DeviceAddress, mpsc::UnboundedSender<Vec<u8>>>>,
    /// Nodes that attached before the controller did.
    pending_joins: Mutex<Vec<DeviceAddress>>,
    closed: AtomicBool,
}

/// Simulated gateway. Cheap to clone; all clones share one link.
#[derive(Debug, Clone, Default)]
pub struct SimGateway {
    shared: Arc<Shared>,
    /// Probability in `[0, 1]` that any single frame is dropped.
    loss: f64,
}

impl SimGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// A lossy link; `loss` is clamped to `[0, 1]`.
    pub fn with_loss(loss: f64) -> Self {
        Self {
            shared: Arc::default(),
            loss: loss.clamp(0.0, 1.0),
        }
    }

    /// Attach a node at `address`, announcing the join to the controller
    /// (or queueing it until one attaches). The returned link is the
    /// node's half of the connection.
    pub fn attach_node(&self, address: DeviceAddress) -> NodeLink {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.nodes.lock().unwrap().insert(address, tx);

        let uplink = self.shared.uplink.lock().unwrap();
        match uplink.as_ref() {
            Some(events) => {
                let _ = events.send(LinkEvent::Joined(address));
            }
            None => self.shared.pending_joins.lock().unwrap().push(address),
        }
        debug!(device = %address, "Node attached to simulated link");

        NodeLink {
            address,
            inbox: rx,
            gateway: self.clone(),
        }
    }

    /// Detach the node at `address` and announce the leave.
    pub fn detach_node(&self, address: DeviceAddress) {
        if self.shared.nodes.lock().unwrap().remove(&address).is_some() {
            debug!(device = %address, "Node detached from simulated link");
            self.push_event(LinkEvent::Left(address));
        }
    }

    /// Device-to-controller traffic, subject to frame loss.
    fn uplink_frame(&self, source: DeviceAddress, payload: Vec<u8>) {
        if self.shared.closed.load(Ordering::SeqCst) || self.lose_frame() {
            return;
        }
        self.push_event(LinkEvent::Frame { source, payload });
    }

    fn push_event(&self, event: LinkEvent) {
        if let Some(events) = self.shared.uplink.lock().unwrap().as_ref() {
            let _ = events.send(event);
        }
    }

    fn lose_frame(&self) -> bool {
        self.loss > 0.0 && rand::rng().random_bool(self.loss)
    }
}

impl GatewayAdapter for SimGateway {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn init(&mut self, events: mpsc::UnboundedSender<LinkEvent>) -> Result<(), AdapterError> {
        // Nodes attached before the controller show up as joins now.
        for address in self.shared.pending_joins.lock().unwrap().drain(..) {
            let _ = events.send(LinkEvent::Joined(address));
        }
        *self.shared.uplink.lock().unwrap() = Some(events);
        Ok(())
    }

    fn send(&self, frame: &[u8]) -> Result<(), AdapterError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(AdapterError::Closed);
        }
        if frame.len() < 4 {
            return Err(AdapterError::Unavailable(format!(
                "frame too short to address: {} bytes",
                frame.len()
            )));
        }
        if self.lose_frame() {
            trace!(bytes = frame.len(), "Simulated frame loss");
            return Ok(());
        }

        let destination =
            DeviceAddress::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
        let nodes = self.shared.nodes.lock().unwrap();
        if destination.is_broadcast() {
            for inbox in nodes.values() {
                let _ = inbox.send(frame.to_vec());
            }
        } else if let Some(inbox) = nodes.get(&destination) {
            let _ = inbox.send(frame.to_vec());
        } else {
            // Radio silence: frames to absent devices just vanish.
            trace!(device = %destination, "Dropping frame to unknown node");
        }
        Ok(())
    }

    fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            debug!("Simulated link closed");
            *self.shared.uplink.lock().unwrap() = None;
            // Dropping the inboxes ends every node loop.
            self.shared.nodes.lock().unwrap().clear();
        }
    }
}

/// A node's half of the simulated link.
pub struct NodeLink {
    address: DeviceAddress,
    inbox: mpsc::UnboundedReceiver<Vec<u8>>,
    gateway: SimGateway,
}

impl NodeLink {
    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    /// Next frame addressed to this node; `None` once the link is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbox.recv().await
    }

    /// Emit a packet toward the controller.
    pub fn emit(&self, packet: &Packet) {
        let payload = packet.encode();
        if let Packet::StatusNotification { .. } = packet {
            trace!(device = %self.address, "Announcing status");
        }
        self.gateway.uplink_frame(self.address, payload);
    }

    /// Leave the link explicitly.
    pub fn detach(&self) {
        self.gateway.detach_node(self.address);
    }
}
