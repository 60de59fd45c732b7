//! Device addressing on the swarm link

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Reserved address matched by every node on the link.
pub const BROADCAST_ADDRESS: DeviceAddress = DeviceAddress(0xFFFF_FFFF);

/// Fixed-width address of a single node, canonically written as eight
/// uppercase hex digits (e.g. `0A1B2C3D`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress(pub u32);

impl DeviceAddress {
    /// Whether this is the reserved broadcast address.
    pub const fn is_broadcast(self) -> bool {
        self.0 == BROADCAST_ADDRESS.0
    }

    pub const fn to_le_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    pub const fn from_le_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(bytes))
    }
}

impl From<u32> for DeviceAddress {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

/// Error parsing a device address from its hex form.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid device address {input:?}: expected up to 8 hex digits")]
pub struct AddressParseError {
    input: String,
}

impl FromStr for DeviceAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
        if digits.is_empty() || digits.len() > 8 {
            return Err(AddressParseError { input: s.to_string() });
        }
        u32::from_str_radix(digits, 16)
            .map(DeviceAddress)
            .map_err(|_| AddressParseError { input: s.to_string() })
    }
}

// Addresses travel through TOML filter lists and JSON output in their
// canonical hex form rather than as bare integers.
impl Serialize for DeviceAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
