//! Firmware images for OTA transfer

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Fixed chunk size on the wire; the final chunk of an image may be
/// shorter. Sized to fit the device-side reassembly buffer.
pub const OTA_CHUNK_SIZE: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FirmwareError {
    #[error("firmware image is empty")]
    Empty,
    #[error("firmware image of {0} bytes exceeds the 32-bit length field")]
    TooLarge(usize),
}

/// A firmware image together with its SHA-256 digest, computed once at
/// construction. The digest travels in the OTA handshake and the device
/// re-computes it after reassembly for the end-to-end integrity check.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    data: Vec<u8>,
    sha256: [u8; 32],
}

impl FirmwareImage {
    pub fn new(data: Vec<u8>) -> Result<Self, FirmwareError> {
        if data.is_empty() {
            return Err(FirmwareError::Empty);
        }
        if data.len() > u32::MAX as usize {
            return Err(FirmwareError::TooLarge(data.len()));
        }
        let sha256 = Sha256::digest(&data).into();
        Ok(Self { data, sha256 })
    }

    /// Image length in bytes, as announced in the OTA handshake. Never
    /// zero.
    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn sha256(&self) -> &[u8; 32] {
        &self.sha256
    }

    /// Digest rendered as lowercase hex for reports and logs.
    pub fn sha256_hex(&self) -> String {
        hex::encode(self.sha256)
    }

    pub fn chunk_count(&self) -> u32 {
        self.data.len().div_ceil(OTA_CHUNK_SIZE) as u32
    }

    /// The bytes of chunk `index`, or `None` past the end. All chunks are
    /// [`OTA_CHUNK_SIZE`] bytes except possibly the last.
    pub fn chunk(&self, index: u32) -> Option<&[u8]> {
        let start = (index as usize).checked_mul(OTA_CHUNK_SIZE)?;
        if start >= self.data.len() {
            return None;
        }
        let end = (start + OTA_CHUNK_SIZE).min(self.data.len());
        Some(&self.data[start..end])
    }

    /// Chunks in transfer order with their indices.
    pub fn chunks(&self) -> impl Iterator<Item = (u32, &[u8])> {
        self.data.chunks(OTA_CHUNK_SIZE).enumerate().map(|(i, c)| (i as u32, c))
    }
}
