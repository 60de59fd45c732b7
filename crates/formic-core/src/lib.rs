//! Formic Core - Protocol types, packet codec, and firmware image handling
//!
//! This crate provides the protocol-level building blocks for the Formic
//! testbed controller:
//! - Device addressing and the broadcast address
//! - Device status/type enums and the registry record type
//! - The binary packet codec spoken over the gateway link
//! - Firmware image chunking and SHA-256 digests for OTA transfers
//!
//! Everything here is synchronous and I/O-free; the controller crate owns
//! all concurrency and transport concerns.

pub mod addr;
pub mod device;
pub mod firmware;
pub mod packet;

pub use addr::{AddressParseError, DeviceAddress, BROADCAST_ADDRESS};
pub use device::{DeviceRecord, DeviceStatus, DeviceType, Position};
pub use firmware::{FirmwareError, FirmwareImage, OTA_CHUNK_SIZE};
pub use packet::{Packet, PacketError};
