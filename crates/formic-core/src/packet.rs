//! Binary packet codec for the gateway link
//!
//! Every packet is laid out as: 4-byte little-endian device address,
//! 1-byte type tag, then the type-specific fields, each fixed-width
//! little-endian. A variable-length field is always last and preceded by
//! a 1-byte explicit length. Link-layer framing and escaping are the
//! gateway's concern; this codec only sees whole payloads.
//!
//! Decoding is total: any byte buffer either yields a packet or a
//! [`PacketError`], never a panic, so line noise cannot take down the
//! inbound consumer.

use thiserror::Error;

use crate::addr::DeviceAddress;
use crate::device::{DeviceStatus, DeviceType, Position};

/// Type tags, one contiguous block: requests first, then notifications.
mod tag {
    pub const STATUS_REQUEST: u8 = 0x80;
    pub const START_REQUEST: u8 = 0x81;
    pub const STOP_REQUEST: u8 = 0x82;
    pub const RESET_REQUEST: u8 = 0x83;
    pub const MESSAGE_REQUEST: u8 = 0x84;
    pub const OTA_START_REQUEST: u8 = 0x85;
    pub const OTA_CHUNK_REQUEST: u8 = 0x86;
    pub const STATUS_NOTIFICATION: u8 = 0x87;
    pub const OTA_START_ACK: u8 = 0x88;
    pub const OTA_CHUNK_ACK: u8 = 0x89;
    pub const EVENT_NOTIFICATION: u8 = 0x8A;
    pub const MESSAGE_NOTIFICATION: u8 = 0x8B;
}

/// Why a byte buffer failed to decode.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("truncated packet: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
    #[error("unknown packet tag 0x{0:02X}")]
    UnknownTag(u8),
    #[error("invalid {field} byte 0x{value:02X}")]
    InvalidField { field: &'static str, value: u8 },
    #[error("length byte declares {declared} bytes but {actual} remain")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("{extra} trailing bytes after packet body")]
    TrailingBytes { extra: usize },
}

/// One logical packet on the link. Requests travel controller to device,
/// notifications device to controller. Every variant leads with the
/// originating or target device address; requests addressed to
/// [`crate::BROADCAST_ADDRESS`] are processed by every node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Ask a node (or all nodes) to report status immediately.
    StatusRequest { device_id: DeviceAddress },
    /// Boot from the bootloader into the user application.
    StartRequest { device_id: DeviceAddress },
    /// Leave the user application and return to the bootloader.
    StopRequest { device_id: DeviceAddress },
    /// Drive a bootloader node back to the given arena position.
    ResetRequest { device_id: DeviceAddress, position: Position },
    /// Free-form user message for a running application (at most 255 bytes).
    MessageRequest { device_id: DeviceAddress, message: Vec<u8> },
    /// OTA handshake: announce an image of `fw_length` bytes in
    /// `chunk_count` chunks with the given SHA-256 digest.
    OtaStartRequest {
        device_id: DeviceAddress,
        fw_length: u32,
        chunk_count: u32,
        sha256: [u8; 32],
    },
    /// One firmware chunk (at most [`crate::OTA_CHUNK_SIZE`] bytes).
    OtaChunkRequest { device_id: DeviceAddress, index: u32, data: Vec<u8> },
    /// Periodic (or requested) device status report.
    StatusNotification {
        device_id: DeviceAddress,
        status: DeviceStatus,
        battery_millivolts: u16,
        device_type: DeviceType,
        position: Position,
    },
    /// The node accepted the OTA handshake and cleared its buffers.
    OtaStartAck { device_id: DeviceAddress },
    /// The node stored chunk `index`; `hashes_match` carries the
    /// end-to-end digest comparison and is meaningful on the final index.
    OtaChunkAck { device_id: DeviceAddress, index: u32, hashes_match: bool },
    /// Application event (GPIO edge, log line) with a device-local
    /// millisecond timestamp.
    EventNotification { device_id: DeviceAddress, timestamp_ms: u32, data: Vec<u8> },
    /// Free-form message from a running application.
    MessageNotification { device_id: DeviceAddress, message: Vec<u8> },
}

impl Packet {
    /// The address this packet is addressed to or originates from.
    pub fn device_id(&self) -> DeviceAddress {
        match self {
            Packet::StatusRequest { device_id }
            | Packet::StartRequest { device_id }
            | Packet::StopRequest { device_id }
            | Packet::ResetRequest { device_id, .. }
            | Packet::MessageRequest { device_id, .. }
            | Packet::OtaStartRequest { device_id, .. }
            | Packet::OtaChunkRequest { device_id, .. }
            | Packet::StatusNotification { device_id, .. }
            | Packet::OtaStartAck { device_id }
            | Packet::OtaChunkAck { device_id, .. }
            | Packet::EventNotification { device_id, .. }
            | Packet::MessageNotification { device_id, .. } => *device_id,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Packet::StatusRequest { .. } => tag::STATUS_REQUEST,
            Packet::StartRequest { .. } => tag::START_REQUEST,
            Packet::StopRequest { .. } => tag::STOP_REQUEST,
            Packet::ResetRequest { .. } => tag::RESET_REQUEST,
            Packet::MessageRequest { .. } => tag::MESSAGE_REQUEST,
            Packet::OtaStartRequest { .. } => tag::OTA_START_REQUEST,
            Packet::OtaChunkRequest { .. } => tag::OTA_CHUNK_REQUEST,
            Packet::StatusNotification { .. } => tag::STATUS_NOTIFICATION,
            Packet::OtaStartAck { .. } => tag::OTA_START_ACK,
            Packet::OtaChunkAck { .. } => tag::OTA_CHUNK_ACK,
            Packet::EventNotification { .. } => tag::EVENT_NOTIFICATION,
            Packet::MessageNotification { .. } => tag::MESSAGE_NOTIFICATION,
        }
    }

    /// Serialize to wire bytes. Variable-length payloads must fit their
    /// 1-byte length field; the controller validates user input before it
    /// reaches this point.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.device_id().to_le_bytes());
        buf.push(self.tag());
        match self {
            Packet::StatusRequest { .. }
            | Packet::StartRequest { .. }
            | Packet::StopRequest { .. }
            | Packet::OtaStartAck { .. } => {}
            Packet::ResetRequest { position, .. } => {
                buf.extend_from_slice(&position.x.to_le_bytes());
                buf.extend_from_slice(&position.y.to_le_bytes());
            }
            Packet::MessageRequest { message, .. }
            | Packet::MessageNotification { message, .. } => {
                push_var_bytes(&mut buf, message);
            }
            Packet::OtaStartRequest { fw_length, chunk_count, sha256, .. } => {
                buf.extend_from_slice(&fw_length.to_le_bytes());
                buf.extend_from_slice(&chunk_count.to_le_bytes());
                buf.extend_from_slice(sha256);
            }
            Packet::OtaChunkRequest { index, data, .. } => {
                buf.extend_from_slice(&index.to_le_bytes());
                push_var_bytes(&mut buf, data);
            }
            Packet::StatusNotification {
                status,
                battery_millivolts,
                device_type,
                position,
                ..
            } => {
                buf.push(status.as_u8());
                buf.extend_from_slice(&battery_millivolts.to_le_bytes());
                buf.push(device_type.as_u8());
                buf.extend_from_slice(&position.x.to_le_bytes());
                buf.extend_from_slice(&position.y.to_le_bytes());
            }
            Packet::OtaChunkAck { index, hashes_match, .. } => {
                buf.extend_from_slice(&index.to_le_bytes());
                buf.push(u8::from(*hashes_match));
            }
            Packet::EventNotification { timestamp_ms, data, .. } => {
                buf.extend_from_slice(&timestamp_ms.to_le_bytes());
                push_var_bytes(&mut buf, data);
            }
        }
        buf
    }

    fn encoded_len(&self) -> usize {
        5 + match self {
            Packet::StatusRequest { .. }
            | Packet::StartRequest { .. }
            | Packet::StopRequest { .. }
            | Packet::OtaStartAck { .. } => 0,
            Packet::ResetRequest { .. } => 8,
            Packet::MessageRequest { message, .. }
            | Packet::MessageNotification { message, .. } => 1 + message.len(),
            Packet::OtaStartRequest { .. } => 40,
            Packet::OtaChunkRequest { data, .. } => 5 + data.len(),
            Packet::StatusNotification { .. } => 12,
            Packet::OtaChunkAck { .. } => 5,
            Packet::EventNotification { data, .. } => 5 + data.len(),
        }
    }

    /// Parse wire bytes back into a packet. Trailing bytes, short
    /// buffers, unknown tags, and out-of-range enum bytes all fail.
    pub fn decode(buf: &[u8]) -> Result<Packet, PacketError> {
        let mut r = Reader::new(buf);
        let device_id = DeviceAddress::from_le_bytes(r.take_array()?);
        let tag = r.take_u8()?;
        let packet = match tag {
            tag::STATUS_REQUEST => Packet::StatusRequest { device_id },
            tag::START_REQUEST => Packet::StartRequest { device_id },
            tag::STOP_REQUEST => Packet::StopRequest { device_id },
            tag::RESET_REQUEST => Packet::ResetRequest {
                device_id,
                position: Position::new(r.take_i32()?, r.take_i32()?),
            },
            tag::MESSAGE_REQUEST => Packet::MessageRequest {
                device_id,
                message: r.take_var_bytes()?.to_vec(),
            },
            tag::OTA_START_REQUEST => Packet::OtaStartRequest {
                device_id,
                fw_length: r.take_u32()?,
                chunk_count: r.take_u32()?,
                sha256: r.take_array()?,
            },
            tag::OTA_CHUNK_REQUEST => Packet::OtaChunkRequest {
                device_id,
                index: r.take_u32()?,
                data: r.take_var_bytes()?.to_vec(),
            },
            tag::STATUS_NOTIFICATION => {
                let status_byte = r.take_u8()?;
                let status = DeviceStatus::from_u8(status_byte)
                    .ok_or(PacketError::InvalidField { field: "status", value: status_byte })?;
                let battery_millivolts = r.take_u16()?;
                let type_byte = r.take_u8()?;
                let device_type = DeviceType::from_u8(type_byte)
                    .ok_or(PacketError::InvalidField { field: "device_type", value: type_byte })?;
                Packet::StatusNotification {
                    device_id,
                    status,
                    battery_millivolts,
                    device_type,
                    position: Position::new(r.take_i32()?, r.take_i32()?),
                }
            }
            tag::OTA_START_ACK => Packet::OtaStartAck { device_id },
            tag::OTA_CHUNK_ACK => {
                let index = r.take_u32()?;
                let flag = r.take_u8()?;
                let hashes_match = match flag {
                    0 => false,
                    1 => true,
                    other => {
                        return Err(PacketError::InvalidField {
                            field: "hashes_match",
                            value: other,
                        })
                    }
                };
                Packet::OtaChunkAck { device_id, index, hashes_match }
            }
            tag::EVENT_NOTIFICATION => Packet::EventNotification {
                device_id,
                timestamp_ms: r.take_u32()?,
                data: r.take_var_bytes()?.to_vec(),
            },
            tag::MESSAGE_NOTIFICATION => Packet::MessageNotification {
                device_id,
                message: r.take_var_bytes()?.to_vec(),
            },
            other => return Err(PacketError::UnknownTag(other)),
        };
        r.finish()?;
        Ok(packet)
    }
}

fn push_var_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    debug_assert!(data.len() <= u8::MAX as usize);
    buf.push(data.len() as u8);
    buf.extend_from_slice(data);
}

/// Bounds-checked forward reader over a packet buffer.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take_bytes(&mut self, n: usize) -> Result<&'a [u8], PacketError> {
        if self.remaining() < n {
            return Err(PacketError::Truncated { need: self.pos + n, got: self.buf.len() });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], PacketError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take_bytes(N)?);
        Ok(out)
    }

    fn take_u8(&mut self) -> Result<u8, PacketError> {
        Ok(self.take_bytes(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16, PacketError> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    fn take_u32(&mut self) -> Result<u32, PacketError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    fn take_i32(&mut self) -> Result<i32, PacketError> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    /// Length-prefixed tail field: the length byte must account for
    /// exactly the bytes that remain.
    fn take_var_bytes(&mut self) -> Result<&'a [u8], PacketError> {
        let declared = self.take_u8()? as usize;
        if declared != self.remaining() {
            return Err(PacketError::LengthMismatch { declared, actual: self.remaining() });
        }
        self.take_bytes(declared)
    }

    fn finish(&self) -> Result<(), PacketError> {
        if self.remaining() > 0 {
            return Err(PacketError::TrailingBytes { extra: self.remaining() });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packets() -> Vec<Packet> {
        let a = DeviceAddress(0x0000_0001);
        let b = DeviceAddress(0xDEAD_BEEF);
        vec![
            Packet::StatusRequest { device_id: crate::BROADCAST_ADDRESS },
            Packet::StartRequest { device_id: a },
            Packet::StopRequest { device_id: b },
            Packet::ResetRequest { device_id: a, position: Position::new(1_000_000, -2_000_000) },
            Packet::MessageRequest { device_id: b, message: b"hello swarm".to_vec() },
            Packet::OtaStartRequest {
                device_id: a,
                fw_length: 300,
                chunk_count: 3,
                sha256: [0xAB; 32],
            },
            Packet::OtaChunkRequest { device_id: a, index: 2, data: vec![0x55; 44] },
            Packet::StatusNotification {
                device_id: b,
                status: DeviceStatus::Running,
                battery_millivolts: 3781,
                device_type: DeviceType::DotBot,
                position: Position::new(500_000, 500_000),
            },
            Packet::OtaStartAck { device_id: a },
            Packet::OtaChunkAck { device_id: a, index: 2, hashes_match: true },
            Packet::EventNotification {
                device_id: b,
                timestamp_ms: 123_456,
                data: b"gpio high".to_vec(),
            },
            Packet::MessageNotification { device_id: a, message: vec![] },
        ]
    }

    #[test]
    fn test_round_trip_all_variants() {
        for packet in sample_packets() {
            let encoded = packet.encode();
            assert_eq!(Packet::decode(&encoded).unwrap(), packet, "variant {:?}", packet);
            // Re-encoding the decoded packet reproduces the same bytes.
            assert_eq!(Packet::decode(&encoded).unwrap().encode(), encoded);
        }
    }

    #[test]
    fn test_start_request_wire_layout() {
        let bytes = Packet::StartRequest { device_id: DeviceAddress(0x0A0B_0C0D) }.encode();
        assert_eq!(bytes, [0x0D, 0x0C, 0x0B, 0x0A, 0x81]);
    }

    #[test]
    fn test_ota_chunk_wire_layout() {
        let packet = Packet::OtaChunkRequest {
            device_id: DeviceAddress(1),
            index: 2,
            data: vec![0xAA, 0xBB],
        };
        assert_eq!(
            packet.encode(),
            [0x01, 0x00, 0x00, 0x00, 0x86, 0x02, 0x00, 0x00, 0x00, 0x02, 0xAA, 0xBB],
        );
    }

    #[test]
    fn test_status_notification_wire_layout() {
        let packet = Packet::StatusNotification {
            device_id: DeviceAddress(0x42),
            status: DeviceStatus::Resetting,
            battery_millivolts: 0x0ABC,
            device_type: DeviceType::SailBot,
            position: Position::new(1, -1),
        };
        assert_eq!(
            packet.encode(),
            [
                0x42, 0x00, 0x00, 0x00, // address
                0x87, // tag
                0x02, // resetting
                0xBC, 0x0A, // battery
                0x02, // sailbot
                0x01, 0x00, 0x00, 0x00, // pos_x
                0xFF, 0xFF, 0xFF, 0xFF, // pos_y = -1
            ],
        );
    }

    #[test]
    fn test_decode_short_buffers_error_out() {
        for packet in sample_packets() {
            let encoded = packet.encode();
            for cut in 0..encoded.len() {
                assert!(
                    Packet::decode(&encoded[..cut]).is_err(),
                    "prefix of length {cut} of {:?} decoded",
                    packet,
                );
            }
        }
    }

    #[test]
    fn test_decode_unknown_tag() {
        let buf = [0x01, 0x00, 0x00, 0x00, 0x7F];
        assert_eq!(Packet::decode(&buf), Err(PacketError::UnknownTag(0x7F)));
    }

    #[test]
    fn test_decode_invalid_status_byte() {
        let mut buf = Packet::StatusNotification {
            device_id: DeviceAddress(1),
            status: DeviceStatus::Bootloader,
            battery_millivolts: 0,
            device_type: DeviceType::Unknown,
            position: Position::default(),
        }
        .encode();
        buf[5] = 9;
        assert_eq!(
            Packet::decode(&buf),
            Err(PacketError::InvalidField { field: "status", value: 9 }),
        );
    }

    #[test]
    fn test_decode_length_byte_mismatch() {
        // Length byte claims 5 bytes, only 2 follow.
        let buf = [0x01, 0x00, 0x00, 0x00, 0x84, 0x05, 0x61, 0x62];
        assert_eq!(
            Packet::decode(&buf),
            Err(PacketError::LengthMismatch { declared: 5, actual: 2 }),
        );
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let mut buf = Packet::StopRequest { device_id: DeviceAddress(1) }.encode();
        buf.push(0x00);
        assert_eq!(Packet::decode(&buf), Err(PacketError::TrailingBytes { extra: 1 }));
    }

    #[test]
    fn test_decode_invalid_hash_flag() {
        let mut buf =
            Packet::OtaChunkAck { device_id: DeviceAddress(1), index: 0, hashes_match: false }
                .encode();
        *buf.last_mut().unwrap() = 2;
        assert_eq!(
            Packet::decode(&buf),
            Err(PacketError::InvalidField { field: "hashes_match", value: 2 }),
        );
    }

    #[test]
    fn test_decode_empty_buffer() {
        assert_eq!(Packet::decode(&[]), Err(PacketError::Truncated { need: 4, got: 0 }));
    }
}
