//! Controller-level errors
//!
//! Only adapter failure at construction and invalid caller input are
//! errors. Protocol-level non-convergence (a timed-out command, a missed
//! OTA handshake, an exhausted chunk retry budget) is reported as partial
//! result data instead, because partial fleet success is the expected
//! common case.

use formic_core::{DeviceAddress, FirmwareError};
use thiserror::Error;

use crate::adapter::AdapterError;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("gateway adapter unavailable: {0}")]
    Adapter(#[from] AdapterError),
    #[error("targets outside the configured device filter: {}", fmt_addresses(.0))]
    OutsideFilter(Vec<DeviceAddress>),
    #[error("the broadcast address is not a valid explicit target")]
    BroadcastTarget,
    #[error("message is {0} bytes, limit is 255")]
    MessageTooLong(usize),
    #[error(transparent)]
    Firmware(#[from] FirmwareError),
    #[error("controller is terminated")]
    Terminated,
}

fn fmt_addresses(addresses: &[DeviceAddress]) -> String {
    let rendered: Vec<String> = addresses.iter().map(ToString::to_string).collect();
    rendered.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outside_filter_message_lists_addresses() {
        let err = ControllerError::OutsideFilter(vec![DeviceAddress(1), DeviceAddress(0xAB)]);
        assert_eq!(
            err.to_string(),
            "targets outside the configured device filter: 00000001, 000000AB",
        );
    }
}
