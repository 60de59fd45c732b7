//! Gateway link abstraction
//!
//! The controller talks to the testbed through a [`GatewayAdapter`]. An
//! adapter owns one radio link (or a simulation of one) and turns its
//! traffic into [`LinkEvent`]s on a channel the controller consumes.

use std::fmt::Debug;

use formic_core::DeviceAddress;
use tokio::sync::mpsc;

/// Something the gateway link reported to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A raw frame arrived from `source`. The payload is an encoded
    /// packet; the controller decodes and attributes it.
    Frame {
        source: DeviceAddress,
        payload: Vec<u8>,
    },
    /// The link saw `source` come up.
    Joined(DeviceAddress),
    /// The link saw `source` go away.
    Left(DeviceAddress),
}

/// Gateway link failure.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// The link could not be brought up or has degraded.
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
    /// Transport-level I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The link was closed and will accept no more frames.
    #[error("gateway link closed")]
    Closed,
}

/// One gateway link to the testbed.
///
/// Implementations are cheap handles onto the actual link state, so the
/// controller can hold one behind an `Arc<dyn GatewayAdapter>` and send
/// from any task. `send` takes a fully encoded frame; addressing,
/// including the broadcast address, lives inside the frame itself.
pub trait GatewayAdapter: Send + Sync + Debug {
    /// Adapter name, for logs.
    fn name(&self) -> &'static str;

    /// Bring the link up and start forwarding traffic to `events`.
    fn init(&mut self, events: mpsc::UnboundedSender<LinkEvent>) -> Result<(), AdapterError>;

    /// Push one encoded frame onto the link.
    fn send(&self, frame: &[u8]) -> Result<(), AdapterError>;

    /// Tear the link down. Idempotent.
    fn close(&self);
}
