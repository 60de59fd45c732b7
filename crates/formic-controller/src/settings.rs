//! Controller settings

use std::time::Duration;

use formic_core::DeviceAddress;
use serde::{Deserialize, Serialize};

/// Tunables for one controller instance. Deserializes from TOML with
/// per-field defaults, so a config file only needs the fields it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSettings {
    /// Optional device subset the controller is allowed to touch, as
    /// canonical hex addresses. Empty means the whole testbed. Scopes
    /// command targets, message delivery, the ready/running/resetting
    /// views, and monitor logging; `known_devices` and `status` always
    /// show the whole registry.
    #[serde(default)]
    pub devices: Vec<DeviceAddress>,
    /// Overall deadline for command and OTA-handshake convergence.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Re-transmit cadence while waiting for convergence or acks.
    #[serde(default = "default_attempt_delay_ms")]
    pub attempt_delay_ms: u64,
    /// Collection window for a `status` sweep of the fleet.
    #[serde(default = "default_status_timeout_ms")]
    pub status_timeout_ms: u64,
    /// Per-attempt wait for an OTA chunk acknowledgment.
    #[serde(default = "default_chunk_timeout_ms")]
    pub chunk_timeout_ms: u64,
    /// Re-sends allowed per chunk after the initial transmission.
    #[serde(default = "default_max_chunk_retries")]
    pub max_chunk_retries: u32,
    /// Silence threshold after which a device is swept from the registry.
    #[serde(default = "default_inactivity_timeout_ms")]
    pub inactivity_timeout_ms: u64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            command_timeout_ms: default_command_timeout_ms(),
            attempt_delay_ms: default_attempt_delay_ms(),
            status_timeout_ms: default_status_timeout_ms(),
            chunk_timeout_ms: default_chunk_timeout_ms(),
            max_chunk_retries: default_max_chunk_retries(),
            inactivity_timeout_ms: default_inactivity_timeout_ms(),
        }
    }
}

fn default_command_timeout_ms() -> u64 {
    5_000
}

fn default_attempt_delay_ms() -> u64 {
    500
}

fn default_status_timeout_ms() -> u64 {
    2_000
}

fn default_chunk_timeout_ms() -> u64 {
    500
}

fn default_max_chunk_retries() -> u32 {
    5
}

fn default_inactivity_timeout_ms() -> u64 {
    5_000 // five missed 1 Hz status announcements
}

impl ControllerSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn attempt_delay(&self) -> Duration {
        Duration::from_millis(self.attempt_delay_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = ControllerSettings::default();
        assert!(settings.devices.is_empty());
        assert_eq!(settings.command_timeout(), Duration::from_secs(5));
        assert_eq!(settings.attempt_delay(), Duration::from_millis(500));
        assert_eq!(settings.chunk_timeout(), Duration::from_millis(500));
        assert_eq!(settings.max_chunk_retries, 5);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let settings: ControllerSettings = toml::from_str(
            r#"
            devices = ["00000001", "DEADBEEF"]
            command_timeout_ms = 100
            "#,
        )
        .unwrap();
        assert_eq!(
            settings.devices,
            vec![DeviceAddress(1), DeviceAddress(0xDEAD_BEEF)],
        );
        assert_eq!(settings.command_timeout_ms, 100);
        assert_eq!(settings.attempt_delay_ms, default_attempt_delay_ms());
        assert_eq!(settings.inactivity_timeout_ms, default_inactivity_timeout_ms());
    }

    #[test]
    fn test_bad_address_in_filter_is_rejected() {
        let parsed: Result<ControllerSettings, _> = toml::from_str(r#"devices = ["xyz"]"#);
        assert!(parsed.is_err());
    }
}
