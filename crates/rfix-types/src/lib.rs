#![forbid(unsafe_code)]
//! Value types shared by the extent store, the fragment ledger, and the
//! repair policies.

mod fingerprint;
mod fragment;

pub use fingerprint::Fingerprint;
pub use fragment::{FRAGMENT_RECORD_LEN, Fragment, TOMBSTONE_RECORD};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Fingerprint and CRC block granularity (128 KiB).
pub const DEFAULT_BLOCK_SIZE: u64 = 128 * 1024;

/// First extent ID reserved for tiny extents.
pub const TINY_EXTENT_START_ID: u64 = 1;

/// Number of tiny extents per partition.
pub const TINY_EXTENT_COUNT: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct PartitionId(pub u64);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Extent identifier within a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ExtentId(pub u64);

impl ExtentId {
    /// Tiny extents pack many small files into one physical extent and are
    /// addressed by the fixed ID range `1..=64`.
    #[must_use]
    pub fn is_tiny(self) -> bool {
        (TINY_EXTENT_START_ID..TINY_EXTENT_START_ID + TINY_EXTENT_COUNT).contains(&self.0)
    }
}

impl fmt::Display for ExtentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Replication consistency mode of the owning partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaType {
    /// Every replica must acknowledge a write. One peer's word is enough to
    /// confirm or deny data during repair.
    #[default]
    Standard,
    /// Writes succeed once a quorum acknowledges. A single peer may be
    /// lagging, so short or empty answers are not trusted on their own.
    Quorum,
}

impl fmt::Display for HaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::Quorum => write!(f, "quorum"),
        }
    }
}

/// Verdict of one repair attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixResult {
    /// The range is consistent (possibly after overwriting local data).
    Success,
    /// A transient condition blocked the decision; try again later.
    Retry,
    /// The data could not be determined by this policy.
    Failed,
}

impl fmt::Display for FixResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "Success"),
            Self::Retry => write!(f, "Retry"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}
