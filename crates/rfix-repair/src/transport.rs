//! Replica transport: the narrow request/response surface repair needs from
//! peer replicas.
//!
//! Connection pooling, packet framing and deadlines belong to the node's
//! replication layer. This module fixes what crosses that boundary: the
//! request shapes, how a peer's textual failure is classified, and how a
//! streamed range reply (including tiny-extent hole markers) is laid into a
//! [`RangeSink`].

use asupersync::Cx;
use rfix_error::{Result, RfixError};
use rfix_types::{ExtentId, Fingerprint, PartitionId};

/// First byte of a range reply argument that stands for a hole.
pub const HOLE_MARKER: u8 = b'E';

/// Encoded length of a fingerprint request argument.
pub const FINGERPRINT_ARG_LEN: usize = 17;

/// Outcome of a fetch that reached the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched<T> {
    /// The peer answered. For absent data this is the empty value.
    Value(T),
    /// The peer has the operation disabled.
    Rejected,
}

impl<T> Fetched<T> {
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected)
    }
}

/// Fingerprint query for one extent range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FingerprintRequest {
    pub partition_id: PartitionId,
    pub extent_id: ExtentId,
    pub offset: u64,
    pub size: u64,
    pub force: bool,
}

impl FingerprintRequest {
    /// Argument bytes: `offset u64 BE ‖ size u64 BE ‖ force u8`.
    #[must_use]
    pub fn encode_arg(&self) -> [u8; FINGERPRINT_ARG_LEN] {
        let mut arg = [0_u8; FINGERPRINT_ARG_LEN];
        arg[0..8].copy_from_slice(&self.offset.to_be_bytes());
        arg[8..16].copy_from_slice(&self.size.to_be_bytes());
        arg[16] = u8::from(self.force);
        arg
    }

    /// Rebuild a request from its header ids and argument bytes.
    pub fn decode_arg(partition_id: PartitionId, extent_id: ExtentId, arg: &[u8]) -> Result<Self> {
        if arg.len() < FINGERPRINT_ARG_LEN {
            return Err(RfixError::Format(format!(
                "fingerprint request arg too short: {} bytes, need {FINGERPRINT_ARG_LEN}",
                arg.len()
            )));
        }
        Ok(Self {
            partition_id,
            extent_id,
            offset: read_be_u64(arg, 0)?,
            size: read_be_u64(arg, 8)?,
            force: arg[16] != 0,
        })
    }
}

/// Repair read of one extent range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeRequest {
    pub partition_id: PartitionId,
    pub extent_id: ExtentId,
    pub offset: u64,
    pub size: u64,
    pub force: bool,
}

impl RangeRequest {
    /// Tiny-extent reads use the hole-aware reply stream.
    #[must_use]
    pub fn is_tiny(&self) -> bool {
        self.extent_id.is_tiny()
    }
}

/// Positional writer that receives the bytes of a range fetch.
///
/// `offset` is relative to the start of the requested range.
pub trait RangeSink {
    fn write_at(&mut self, cx: &Cx, offset: u64, data: &[u8]) -> Result<()>;
}

/// One reply packet of a streamed range read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeReply<'a> {
    Data(&'a [u8]),
    /// A run of `len` bytes the peer holds no data for.
    Hole(u64),
}

impl<'a> RangeReply<'a> {
    /// Interpret a reply packet.
    ///
    /// For tiny extents an argument beginning with [`HOLE_MARKER`] carries the
    /// hole length as `u64 BE` in bytes `1..9`. A non-zero `arg_crc` must equal
    /// the CRC-32/IEEE of the whole argument.
    pub fn from_packet(tiny: bool, arg: &[u8], arg_crc: u64, data: &'a [u8]) -> Result<Self> {
        if !tiny || arg.first() != Some(&HOLE_MARKER) {
            return Ok(Self::Data(data));
        }
        if arg_crc > 0 && arg_crc != u64::from(crc32fast::hash(arg)) {
            return Err(RfixError::Format("CRC mismatch".to_owned()));
        }
        Ok(Self::Hole(read_be_u64(arg, 1)?))
    }

    /// Encode a hole marker argument and its CRC, as a serving peer would.
    #[must_use]
    pub fn hole_marker(len: u64) -> ([u8; 9], u64) {
        let mut arg = [0_u8; 9];
        arg[0] = HOLE_MARKER;
        arg[1..9].copy_from_slice(&len.to_be_bytes());
        let crc = u64::from(crc32fast::hash(&arg));
        (arg, crc)
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        match self {
            Self::Data(data) => data.len() as u64,
            Self::Hole(len) => *len,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Progress of one streamed range read.
///
/// Clients feed each reply through [`RangeCursor::apply`] until
/// [`RangeCursor::is_done`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeCursor {
    position: u64,
    remaining: u64,
}

impl RangeCursor {
    #[must_use]
    pub fn new(size: u64) -> Self {
        Self {
            position: 0,
            remaining: size,
        }
    }

    /// Write data replies to `sink`; skip holes without writing.
    pub fn apply(&mut self, cx: &Cx, reply: RangeReply<'_>, sink: &mut dyn RangeSink) -> Result<()> {
        if let RangeReply::Data(data) = reply {
            if !data.is_empty() {
                sink.write_at(cx, self.position, data)?;
            }
        }
        let len = reply.len();
        self.position = self.position.saturating_add(len);
        self.remaining = self.remaining.saturating_sub(len);
        Ok(())
    }

    /// Bytes accounted for so far, holes included.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.position
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.remaining == 0
    }
}

/// Classification of a peer's non-OK reply that is not a hard error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteVerdict {
    /// The peer has no data for the range.
    Absent,
    /// The peer has the operation disabled.
    Rejected,
}

impl RemoteVerdict {
    /// Convert to a fetch outcome, using `empty` for absent data.
    pub fn into_fetched<T>(self, empty: T) -> Fetched<T> {
        match self {
            Self::Absent => Fetched::Value(empty),
            Self::Rejected => Fetched::Rejected,
        }
    }
}

/// Map a peer's textual failure message.
///
/// Missing extents, reads past the end and parameter mismatches mean the peer
/// holds no data, which repair treats as an answer. "operation disabled" is a
/// rejection. "unknown op" means the peer predates the operation. Anything
/// else is a hard remote error.
pub fn classify_remote_error(host: &str, msg: &str) -> Result<RemoteVerdict> {
    if msg.contains("does not exist") || msg.contains("EOF") || msg.contains("parameter mismatch")
    {
        return Ok(RemoteVerdict::Absent);
    }
    if msg.contains("operation disabled") {
        return Ok(RemoteVerdict::Rejected);
    }
    if msg.contains("unknown op") {
        return Err(RfixError::UnknownOp(msg.to_owned()));
    }
    Err(RfixError::Remote {
        host: host.to_owned(),
        detail: msg.to_owned(),
    })
}

/// Client for the repair operations served by peer replicas.
pub trait ReplicaClient: Send + Sync {
    /// Fingerprint of a range on `host`. Absent data yields an empty value.
    fn fetch_fingerprint(
        &self,
        cx: &Cx,
        host: &str,
        request: &FingerprintRequest,
    ) -> Result<Fetched<Fingerprint>>;

    /// Stream a range from `host` into `sink` and return the bytes accounted
    /// for, holes included. Absent data yields `Value(0)`.
    fn fetch_range(
        &self,
        cx: &Cx,
        host: &str,
        request: &RangeRequest,
        sink: &mut dyn RangeSink,
    ) -> Result<Fetched<u64>>;
}

fn read_be_u64(bytes: &[u8], offset: usize) -> Result<u64> {
    let arr: [u8; 8] = bytes
        .get(offset..offset + 8)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| RfixError::Format(format!("read_be_u64 out of bounds at {offset}")))?;
    Ok(u64::from_be_bytes(arr))
}
