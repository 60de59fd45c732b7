//! Device model: status, type, and the registry record

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::addr::DeviceAddress;

/// Lifecycle state of a node, as last reported by the node itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Idle in the bootloader, ready for commands and OTA.
    Bootloader,
    /// Running the user application.
    Running,
    /// Moving back to its assigned position.
    Resetting,
}

impl DeviceStatus {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Bootloader),
            1 => Some(Self::Running),
            2 => Some(Self::Resetting),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Bootloader => 0,
            Self::Running => 1,
            Self::Resetting => 2,
        }
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Bootloader => "Bootloader",
            Self::Running => "Running",
            Self::Resetting => "Resetting",
        };
        write!(f, "{name}")
    }
}

/// Hardware flavor of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Unknown,
    DotBot,
    SailBot,
    FreeBot,
    Xgo,
}

impl DeviceType {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Unknown),
            1 => Some(Self::DotBot),
            2 => Some(Self::SailBot),
            3 => Some(Self::FreeBot),
            4 => Some(Self::Xgo),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::DotBot => 1,
            Self::SailBot => 2,
            Self::FreeBot => 3,
            Self::Xgo => 4,
        }
    }
}

impl Default for DeviceType {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unknown => "Unknown",
            Self::DotBot => "DotBot",
            Self::SailBot => "SailBot",
            Self::FreeBot => "FreeBot",
            Self::Xgo => "XGO",
        };
        write!(f, "{name}")
    }
}

/// A 2D testbed position in micro-units (micrometers on the arena plane).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let to_m = |v: i32| v as f64 / 1e6;
        write!(f, "({:.3}, {:.3})", to_m(self.x), to_m(self.y))
    }
}

/// Registry entry for one known node.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceRecord {
    /// Link address of the node.
    pub address: DeviceAddress,
    /// Last observed lifecycle state.
    pub status: DeviceStatus,
    /// Hardware flavor from the last status frame.
    pub device_type: DeviceType,
    /// Battery level in millivolts from the last status frame.
    pub battery_millivolts: u16,
    /// Last reported position, if a status frame has been seen.
    pub position: Option<Position>,
    /// Monotonic timestamp of the last status frame (or the join event).
    #[serde(skip)]
    pub last_seen: Instant,
}

impl DeviceRecord {
    /// Record for a node that joined the link but has not reported status
    /// yet. Nodes come up in the bootloader.
    pub fn joined(address: DeviceAddress, now: Instant) -> Self {
        Self {
            address,
            status: DeviceStatus::Bootloader,
            device_type: DeviceType::Unknown,
            battery_millivolts: 0,
            position: None,
            last_seen: now,
        }
    }

    /// Time since the node was last heard from.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    /// Whether the node has been silent longer than `threshold`.
    pub fn is_stale(&self, now: Instant, threshold: Duration) -> bool {
        self.age(now) > threshold
    }
}
