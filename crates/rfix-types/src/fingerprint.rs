//! Per-block digest list of an extent byte range.
//!
//! A fingerprint is cheap to exchange with a peer and, unlike a single range
//! checksum, tells where two versions first diverge: digest `i` covers the
//! `i`-th block-aligned piece of the queried range, where block boundaries
//! are multiples of the block size in extent coordinates.

use rfix_error::{Result, RfixError};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    blocks: Vec<u32>,
}

impl Fingerprint {
    #[must_use]
    pub fn from_blocks(blocks: Vec<u32>) -> Self {
        Self { blocks }
    }

    /// Fingerprint `data`, which starts at extent byte `offset`.
    ///
    /// A zero `block_size` is treated as one block covering all of `data`.
    #[must_use]
    pub fn compute(offset: u64, data: &[u8], block_size: u64) -> Self {
        if block_size == 0 {
            if data.is_empty() {
                return Self::default();
            }
            return Self::from_blocks(vec![crc32c::crc32c(data)]);
        }
        let mut blocks = Vec::new();
        let mut pos = offset;
        let mut rest = data;
        while !rest.is_empty() {
            let next_boundary = (pos / block_size).saturating_add(1).saturating_mul(block_size);
            let take = usize::try_from(next_boundary.saturating_sub(pos))
                .unwrap_or(usize::MAX)
                .clamp(1, rest.len());
            let (head, tail) = rest.split_at(take);
            blocks.push(crc32c::crc32c(head));
            pos = pos.saturating_add(take as u64);
            rest = tail;
        }
        Self { blocks }
    }

    #[must_use]
    pub fn blocks(&self) -> &[u32] {
        &self.blocks
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// An empty fingerprint means "no data in this range".
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Index of the first block whose digest differs from `other`.
    ///
    /// When one fingerprint is a prefix of the other, the shorter length is
    /// returned. Equal fingerprints return their length.
    #[must_use]
    pub fn first_conflict(&self, other: &Self) -> usize {
        self.blocks
            .iter()
            .zip(other.blocks.iter())
            .position(|(a, b)| a != b)
            .unwrap_or_else(|| self.blocks.len().min(other.blocks.len()))
    }

    /// Wire encoding: `count: u32 BE` followed by `count` digests, each `u32 BE`.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.blocks.len() * 4);
        let count = u32::try_from(self.blocks.len()).unwrap_or(u32::MAX);
        buf.extend_from_slice(&count.to_be_bytes());
        for digest in self.blocks.iter().take(count as usize) {
            buf.extend_from_slice(&digest.to_be_bytes());
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        let header: [u8; 4] = bytes
            .get(..4)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| RfixError::Format(format!("fingerprint header too short: {}", bytes.len())))?;
        let count = u32::from_be_bytes(header) as usize;
        let body = &bytes[4..];
        if body.len() != count.saturating_mul(4) {
            return Err(RfixError::Format(format!(
                "fingerprint length mismatch: {count} digests declared, {} body bytes",
                body.len()
            )));
        }
        let blocks = body
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self { blocks })
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, digest) in self.blocks.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{digest:08x}")?;
        }
        write!(f, "]")
    }
}
