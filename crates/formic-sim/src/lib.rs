//! In-process simulation of a robot testbed
//!
//! Provides a [`SimGateway`] that satisfies the controller's adapter
//! trait, [`SimNode`] tasks that behave like device firmware behind it,
//! and the TOML settings describing a fleet. The binary in this crate
//! wires the three together into a command-line testbed; integration
//! tests drive the same pieces directly.

pub mod gateway;
pub mod node;
pub mod settings;

pub use gateway::{NodeLink, SimGateway};
pub use node::{DropChunkAcks, NodeConfig, NodeHandle, SimNode};
pub use settings::{load_settings, NodeSettings, SimSettings};
