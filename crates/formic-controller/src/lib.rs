//! Fleet control and firmware transfer for the Formic robot testbed.
//!
//! The entry point is [`Controller`], built over a [`GatewayAdapter`]
//! that speaks to the testbed's radio gateway (or a simulation of it).
//! The controller tracks device liveness in a registry, dispatches
//! start/stop/reset/message commands with retry-until-convergence, and
//! runs two-phase chunked OTA firmware transfers.

pub mod adapter;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod ota;
pub mod registry;
pub mod settings;

pub use adapter::{AdapterError, GatewayAdapter, LinkEvent};
pub use controller::{Controller, FleetEvent};
pub use dispatch::CommandOutcome;
pub use error::ControllerError;
pub use ota::{StartOtaReport, TransferOutcome};
pub use registry::DeviceRegistry;
pub use settings::ControllerSettings;
