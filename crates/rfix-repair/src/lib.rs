#![forbid(unsafe_code)]
//! Crash-consistency repair for extent partitions.
//!
//! After an unclean shutdown, byte ranges that may have been torn are
//! registered with a partition's [`Fixer`]. The fixer persists them in a
//! fixed-record ledger, then reconciles each against peer replicas with a
//! chain of consistency policies until the range is proven consistent. Ranges
//! that cannot be decided stay registered and raise an operator alert.

pub mod alert;
pub mod config;
pub mod fixer;
pub mod ledger;
pub mod limiter;
pub mod policy;
pub mod queue;
pub mod sink;
pub mod topology;
pub mod transport;

pub use alert::{Alerter, RecordingAlerter, TracingAlerter};
pub use config::FixerConfig;
pub use fixer::{Fixer, FixerOptions, FixerStats, FixerStatus, FragmentView, RepairEnv};
pub use ledger::{FragmentIndexEntry, FragmentLedger, LedgerStats};
pub use limiter::{ConcurrencyPermit, DiskConcurrencyLimiter, IoLimiter, RepairOp, Unlimited};
pub use policy::{
    FastTrustPolicy, RepairContext, RepairPolicy, StdQuorumPolicy, StdTrustPolicy,
    conflict_range, default_policies, quorum_threshold, run_chain,
};
pub use queue::RepairQueue;
pub use sink::{ExtentSink, StagingFile};
pub use topology::{StaticTopology, Topology};
pub use transport::{
    FINGERPRINT_ARG_LEN, Fetched, FingerprintRequest, HOLE_MARKER, RangeCursor, RangeReply,
    RangeRequest, RangeSink, RemoteVerdict, ReplicaClient, classify_remote_error,
};
