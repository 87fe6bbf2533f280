//! Suspect byte range of one extent and its fixed-size ledger record.
//!
//! # Record layout
//!
//! ```text
//! +--------------+--------+
//! | extent_id    | 8 bytes| big-endian
//! | offset       | 8 bytes| big-endian
//! | size         | 8 bytes| big-endian
//! | crc          | 4 bytes| CRC-32/IEEE of the 24 bytes above, big-endian
//! +--------------+--------+
//! ```
//!
//! An erased ledger slot holds the encoding of the all-zero fragment, which is
//! [`TOMBSTONE_RECORD`]: 24 zero bytes followed by `a3 c1 ca 20`. Because the
//! tombstone is itself a valid record, a loader can tell an erased slot from
//! a torn write without any out-of-band marker.

use rfix_error::{Result, RfixError};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ExtentId;

/// Encoded length of one fragment record.
pub const FRAGMENT_RECORD_LEN: usize = 28;

/// Encoding of the all-zero fragment, written over erased slots.
pub const TOMBSTONE_RECORD: [u8; FRAGMENT_RECORD_LEN] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0xa3, 0xc1, 0xca, 0x20,
];

const PAYLOAD_LEN: usize = 24;

/// A byte range `[offset, offset + size)` of one extent suspected corrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Fragment {
    pub extent_id: ExtentId,
    pub offset: u64,
    pub size: u64,
}

impl Fragment {
    #[must_use]
    pub fn new(extent_id: ExtentId, offset: u64, size: u64) -> Self {
        Self {
            extent_id,
            offset,
            size,
        }
    }

    /// Exclusive end of the range, saturating at `u64::MAX`.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }

    /// True for the all-zero sentinel that marks an erased ledger slot.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extent_id.0 == 0 && self.offset == 0 && self.size == 0
    }

    /// True when `[offset, offset + size)` of `extent_id` intersects this range.
    #[must_use]
    pub fn overlaps(&self, extent_id: ExtentId, offset: u64, size: u64) -> bool {
        if self.extent_id != extent_id || self.size == 0 || size == 0 {
            return false;
        }
        offset < self.end() && self.offset < offset.saturating_add(size)
    }

    /// Encode into the fixed 28-byte ledger record.
    #[must_use]
    pub fn encode(&self) -> [u8; FRAGMENT_RECORD_LEN] {
        let mut buf = [0_u8; FRAGMENT_RECORD_LEN];
        buf[0..8].copy_from_slice(&self.extent_id.0.to_be_bytes());
        buf[8..16].copy_from_slice(&self.offset.to_be_bytes());
        buf[16..24].copy_from_slice(&self.size.to_be_bytes());
        let crc = crc32fast::hash(&buf[..PAYLOAD_LEN]);
        buf[PAYLOAD_LEN..].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Decode a ledger record.
    ///
    /// Fails with [`RfixError::CorruptRecord`] when fewer than 28 bytes are
    /// given or the trailing checksum does not match. The tombstone decodes
    /// successfully to the empty fragment.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FRAGMENT_RECORD_LEN {
            return Err(RfixError::CorruptRecord {
                offset: 0,
                detail: format!(
                    "record too short: {} bytes, need {FRAGMENT_RECORD_LEN}",
                    bytes.len()
                ),
            });
        }
        let stored = read_be_u32(bytes, PAYLOAD_LEN)?;
        let computed = crc32fast::hash(&bytes[..PAYLOAD_LEN]);
        if stored != computed {
            return Err(RfixError::CorruptRecord {
                offset: 0,
                detail: format!("CRC mismatch: stored {stored:#010x}, computed {computed:#010x}"),
            });
        }
        Ok(Self {
            extent_id: ExtentId(read_be_u64(bytes, 0)?),
            offset: read_be_u64(bytes, 8)?,
            size: read_be_u64(bytes, 16)?,
        })
    }
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Fragment(extent={}, offset={}, size={})",
            self.extent_id, self.offset, self.size
        )
    }
}

fn read_be_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    let arr: [u8; 4] = bytes
        .get(offset..offset + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| RfixError::Format(format!("read_be_u32 out of bounds at {offset}")))?;
    Ok(u32::from_be_bytes(arr))
}

fn read_be_u64(bytes: &[u8], offset: usize) -> Result<u64> {
    let arr: [u8; 8] = bytes
        .get(offset..offset + 8)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| RfixError::Format(format!("read_be_u64 out of bounds at {offset}")))?;
    Ok(u64::from_be_bytes(arr))
}
