#![forbid(unsafe_code)]
//! Error types for the extent risk-repair subsystem.
//!
//! # Error Taxonomy
//!
//! Repair code does not treat every error the same way. Errors fall into
//! three families, and the consistency policies branch on the family rather
//! than on individual variants:
//!
//! | Family | Variants | Meaning for repair |
//! |--------|----------|--------------------|
//! | Absent data | `ExtentNotFound`, `Eof`, `ParameterMismatch`, `Io(NotFound)` | The range holds no data here. Not a failure: an empty fingerprint / zero CRC. |
//! | Unsupported | `UnknownOp` | The peer runs a protocol version without the operation. Counted separately so a unanimous answer ends the policy with `Failed`. |
//! | Everything else | `Io`, `Remote`, `LimiterUnavailable`, ... | Transient from the repair point of view: the fragment is retried later. |
//!
//! Ledger-level corruption (`CorruptRecord`, `BrokenLedger`) is the one class
//! that is fatal: a ledger that cannot be decoded must not be trusted as
//! "zero outstanding fragments".
//!
//! ## Design Constraints
//!
//! - `rfix-error` depends on nothing but `thiserror`; value types live in
//!   `rfix-types` and convert their own failures into `RfixError`.
//! - All string payloads are owned so errors can cross worker threads.

use thiserror::Error;

/// Unified error type for ledger, storage, and replica operations.
#[derive(Debug, Error)]
pub enum RfixError {
    /// Operating system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A ledger record failed to decode (short read or checksum mismatch).
    ///
    /// `offset` is the byte offset of the record inside the ledger file, or 0
    /// when decoding a detached buffer.
    #[error("corrupt fragment record at offset {offset}: {detail}")]
    CorruptRecord { offset: u64, detail: String },

    /// The ledger file as a whole is unusable (unexpected short read after
    /// tail truncation, impossible length).
    #[error("broken fragment ledger: {0}")]
    BrokenLedger(String),

    /// The extent does not exist in the local or remote store.
    #[error("extent {0} does not exist")]
    ExtentNotFound(u64),

    /// Read past the end of the extent.
    #[error("EOF")]
    Eof,

    /// The requested range does not fit the extent (offset/size mismatch).
    #[error("parameter mismatch: {0}")]
    ParameterMismatch(String),

    /// The remote peer does not know the requested opcode.
    #[error("unknown op: {0}")]
    UnknownOp(String),

    /// Any other failure reported by a remote peer or the transport.
    #[error("remote {host}: {detail}")]
    Remote { host: String, detail: String },

    /// The I/O limiter refused to hand out a permit.
    #[error("limiter unavailable: {0}")]
    LimiterUnavailable(String),

    /// Operation cancelled through the capability context or a stop request.
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid encoding, configuration, or argument.
    #[error("invalid format: {0}")]
    Format(String),

    /// A repair step could not complete.
    #[error("repair failed: {0}")]
    RepairFailed(String),
}

impl RfixError {
    /// True when the error only says "there is no data in this range".
    ///
    /// Repair treats such ranges as holes: local fingerprints become empty,
    /// local CRCs become zero, and remote replies become empty values.
    #[must_use]
    pub fn is_absent_data(&self) -> bool {
        match self {
            Self::ExtentNotFound(_) | Self::Eof | Self::ParameterMismatch(_) => true,
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::UnexpectedEof
            ),
            Self::CorruptRecord { .. }
            | Self::BrokenLedger(_)
            | Self::UnknownOp(_)
            | Self::Remote { .. }
            | Self::LimiterUnavailable(_)
            | Self::Cancelled
            | Self::Format(_)
            | Self::RepairFailed(_) => false,
        }
    }

    /// True when a peer rejected the request because it is too old to know it.
    #[must_use]
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::UnknownOp(_))
    }

    /// True for errors that make a ledger untrustworthy.
    #[must_use]
    pub fn is_ledger_corruption(&self) -> bool {
        matches!(self, Self::CorruptRecord { .. } | Self::BrokenLedger(_))
    }
}

/// Result alias using `RfixError`.
pub type Result<T> = std::result::Result<T, RfixError>;
