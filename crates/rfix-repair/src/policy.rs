//! Consistency policies.
//!
//! A fragment is reconciled by running policies in order until one returns
//! [`FixResult::Success`] or [`FixResult::Retry`]. `Failed` from one policy
//! only passes the fragment to the next; the chain is `Failed` when every
//! policy is.
//!
//! | Policy | Transfers | Trusts |
//! |--------|-----------|--------|
//! | [`FastTrustPolicy`] | fingerprints, then the tail from the first divergent block | the first peer that answers |
//! | [`StdTrustPolicy`] | the whole range, straight into the extent | the first peer that answers |
//! | [`StdQuorumPolicy`] | the whole range from every peer, staged | a CRC held by a quorum of peers |

use asupersync::Cx;
use rfix_error::{Result, RfixError};
use rfix_extent::ExtentStore;
use rfix_types::{Fingerprint, FixResult, Fragment, HaType, PartitionId};
use std::cell::OnceCell;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

use crate::limiter::{IoLimiter, RepairOp};
use crate::sink::{ExtentSink, StagingFile};
use crate::transport::{Fetched, FingerprintRequest, RangeRequest, ReplicaClient};

/// Everything a policy may look at or touch while repairing one fragment.
///
/// Local fingerprint and CRC are computed at most once per context and shared
/// by every policy in the chain.
pub struct RepairContext<'a> {
    pub cx: &'a Cx,
    pub partition_id: PartitionId,
    pub fragment: Fragment,
    pub hosts: Vec<String>,
    pub ha_type: HaType,
    pub disk_path: &'a str,
    pub staging_dir: &'a Path,
    /// Chunk size for CRC reads and staged applies. Fingerprint blocks are
    /// the engine's own, see [`ExtentStore::fingerprint_block_size`].
    pub block_size: u64,
    pub storage: &'a dyn ExtentStore,
    pub replicas: &'a dyn ReplicaClient,
    pub limiter: &'a dyn IoLimiter,
    local_fingerprint: OnceCell<std::result::Result<Fingerprint, String>>,
    local_crc: OnceCell<std::result::Result<u32, String>>,
}

impl<'a> RepairContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cx: &'a Cx,
        partition_id: PartitionId,
        fragment: Fragment,
        hosts: Vec<String>,
        ha_type: HaType,
        disk_path: &'a str,
        staging_dir: &'a Path,
        block_size: u64,
        storage: &'a dyn ExtentStore,
        replicas: &'a dyn ReplicaClient,
        limiter: &'a dyn IoLimiter,
    ) -> Self {
        Self {
            cx,
            partition_id,
            fragment,
            hosts,
            ha_type,
            disk_path,
            staging_dir,
            block_size,
            storage,
            replicas,
            limiter,
            local_fingerprint: OnceCell::new(),
            local_crc: OnceCell::new(),
        }
    }

    /// Local fingerprint of the fragment range; absent data is an empty
    /// fingerprint.
    pub fn local_fingerprint(&self) -> Result<&Fingerprint> {
        self.local_fingerprint
            .get_or_init(|| {
                let f = self.fragment;
                let computed = match self
                    .storage
                    .fingerprint(self.cx, f.extent_id, f.offset, f.size, true)
                {
                    Err(e) if e.is_absent_data() => Ok(Fingerprint::default()),
                    other => other,
                };
                debug!(
                    target: "rfix::policy",
                    partition = self.partition_id.0,
                    fragment = %f,
                    fingerprint = ?computed.as_ref().ok().map(ToString::to_string),
                    error = ?computed.as_ref().err().map(ToString::to_string),
                    "local_fingerprint_computed"
                );
                computed.map_err(|e| e.to_string())
            })
            .as_ref()
            .map_err(|e| RfixError::RepairFailed(e.clone()))
    }

    /// CRC-32/IEEE of the local fragment range, read in block-size chunks.
    /// Zero when the range holds no data.
    pub fn local_crc(&self) -> Result<u32> {
        self.local_crc
            .get_or_init(|| {
                let computed = self.compute_local_crc();
                debug!(
                    target: "rfix::policy",
                    partition = self.partition_id.0,
                    fragment = %self.fragment,
                    crc = ?computed.as_ref().ok(),
                    error = ?computed.as_ref().err().map(ToString::to_string),
                    "local_crc_computed"
                );
                computed.map_err(|e| e.to_string())
            })
            .clone()
            .map_err(RfixError::RepairFailed)
    }

    fn compute_local_crc(&self) -> Result<u32> {
        let f = self.fragment;
        let chunk = self.block_size.max(1);
        let mut hasher = crc32fast::Hasher::new();
        let mut buf = Vec::new();
        let mut pos = f.offset;
        let end = f.end();
        while pos < end {
            let len = (end - pos).min(chunk);
            self.limiter
                .wait_flow(RepairOp::RepairReadCrc, len, self.disk_path)?;
            let len_usize = usize::try_from(len)
                .map_err(|_| RfixError::Format(format!("block size {len} exceeds address space")))?;
            buf.resize(len_usize, 0);
            match self.storage.read(self.cx, f.extent_id, pos, &mut buf) {
                Ok(()) => {}
                Err(e) if e.is_absent_data() => return Ok(0),
                Err(e) => return Err(e),
            }
            hasher.update(&buf);
            pos += len;
        }
        Ok(hasher.finalize())
    }

    /// Whether the local extent exists and covers the whole fragment.
    pub fn local_covers_fragment(&self) -> Result<bool> {
        let f = self.fragment;
        if !self.storage.exists(f.extent_id) {
            return Ok(false);
        }
        let local_size = if f.extent_id.is_tiny() {
            self.storage.tiny_extent_size(f.extent_id)?
        } else {
            self.storage.watermark(f.extent_id)?
        };
        Ok(local_size >= f.end())
    }

    fn extent_sink(&self, base: u64) -> ExtentSink<'_> {
        ExtentSink::new(
            self.storage,
            self.limiter,
            self.disk_path,
            self.fragment.extent_id,
            base,
        )
    }

    fn range_request(&self, offset: u64, size: u64, force: bool) -> RangeRequest {
        RangeRequest {
            partition_id: self.partition_id,
            extent_id: self.fragment.extent_id,
            offset,
            size,
            force,
        }
    }
}

/// One repair decision procedure.
pub trait RepairPolicy: Send + Sync {
    fn name(&self) -> &'static str;
    fn repair(&self, ctx: &RepairContext<'_>) -> FixResult;
}

/// The standard chain: fast trust, standard trust, quorum.
#[must_use]
pub fn default_policies() -> Vec<Arc<dyn RepairPolicy>> {
    vec![
        Arc::new(FastTrustPolicy),
        Arc::new(StdTrustPolicy),
        Arc::new(StdQuorumPolicy),
    ]
}

/// Run `policies` in order; the first `Success` or `Retry` wins.
pub fn run_chain(policies: &[Arc<dyn RepairPolicy>], ctx: &RepairContext<'_>) -> FixResult {
    let f = ctx.fragment;
    for policy in policies {
        let started = Instant::now();
        let result = policy.repair(ctx);
        warn!(
            target: "rfix::policy",
            policy = policy.name(),
            partition = ctx.partition_id.0,
            extent = f.extent_id.0,
            offset = f.offset,
            size = f.size,
            %result,
            elapsed_us = elapsed_us(started),
            "policy_verdict"
        );
        if matches!(result, FixResult::Success | FixResult::Retry) {
            return result;
        }
    }
    error!(
        target: "rfix::policy",
        partition = ctx.partition_id.0,
        extent = f.extent_id.0,
        offset = f.offset,
        size = f.size,
        "all_policies_failed"
    );
    FixResult::Failed
}

/// Range to refetch after the first divergent block: from the start of that
/// block (never before `offset`) to the end of the fragment.
#[must_use]
pub fn conflict_range(offset: u64, size: u64, block_size: u64, first_conflict: usize) -> (u64, u64) {
    let block_size = block_size.max(1);
    let conflict_block = (offset / block_size).saturating_add(first_conflict as u64);
    let conflict_offset = conflict_block.saturating_mul(block_size).max(offset);
    let end = offset.saturating_add(size);
    (conflict_offset, end.saturating_sub(conflict_offset))
}

/// Hosts that must hold the same CRC for it to win a vote among `hosts`.
#[must_use]
pub fn quorum_threshold(hosts: usize) -> usize {
    (hosts + 1) / 2 + 1
}

/// Compare fingerprints with each peer and refetch only from the first
/// divergent block. Not applicable to tiny extents.
#[derive(Debug, Clone, Copy, Default)]
pub struct FastTrustPolicy;

impl RepairPolicy for FastTrustPolicy {
    fn name(&self) -> &'static str {
        "FastTrust"
    }

    fn repair(&self, ctx: &RepairContext<'_>) -> FixResult {
        let f = ctx.fragment;
        if f.extent_id.is_tiny() {
            return FixResult::Failed;
        }
        let local = match ctx.local_fingerprint() {
            Ok(local) => local,
            Err(e) => {
                error!(target: "rfix::policy", fragment = %f, error = %e, "local_fingerprint_failed");
                return FixResult::Retry;
            }
        };
        if local.is_empty() {
            return FixResult::Success;
        }
        if ctx.hosts.is_empty() {
            return FixResult::Failed;
        }

        let (mut rejects, mut failures, mut unsupported) = (0_usize, 0_usize, 0_usize);
        for host in &ctx.hosts {
            let request = FingerprintRequest {
                partition_id: ctx.partition_id,
                extent_id: f.extent_id,
                offset: f.offset,
                size: f.size,
                force: false,
            };
            let started = Instant::now();
            let fetched = ctx.replicas.fetch_fingerprint(ctx.cx, host, &request);
            debug!(
                target: "rfix::policy",
                fragment = %f,
                host = host.as_str(),
                rejected = matches!(fetched, Ok(Fetched::Rejected)),
                error = ?fetched.as_ref().err().map(ToString::to_string),
                elapsed_us = elapsed_us(started),
                "remote_fingerprint_fetched"
            );
            let remote = match fetched {
                Err(e) => {
                    if e.is_unsupported() {
                        unsupported += 1;
                    }
                    failures += 1;
                    continue;
                }
                Ok(Fetched::Rejected) => {
                    rejects += 1;
                    continue;
                }
                Ok(Fetched::Value(remote)) => remote,
            };
            debug!(target: "rfix::policy", fragment = %f, host = host.as_str(), local = %local, remote = %remote, "fingerprints_compared");
            if remote.is_empty() {
                if ctx.ha_type == HaType::Quorum {
                    continue;
                }
                return FixResult::Success;
            }
            if *local == remote {
                return FixResult::Success;
            }

            let first = local.first_conflict(&remote);
            let (conflict_offset, conflict_size) = conflict_range(
                f.offset,
                f.size,
                ctx.storage.fingerprint_block_size(),
                first,
            );
            debug!(
                target: "rfix::policy",
                fragment = %f,
                host = host.as_str(),
                first_conflict = first,
                conflict_offset,
                conflict_size,
                "conflict_located"
            );
            if conflict_size == 0 {
                // Divergent, yet no byte of the fragment to refetch.
                error!(
                    target: "rfix::policy",
                    partition = ctx.partition_id.0,
                    fragment = %f,
                    host = host.as_str(),
                    first_conflict = first,
                    "conflict_outside_fragment"
                );
                return FixResult::Failed;
            }

            let mut sink = ctx.extent_sink(conflict_offset);
            let request = ctx.range_request(conflict_offset, conflict_size, false);
            match ctx.replicas.fetch_range(ctx.cx, host, &request, &mut sink) {
                Err(e) => {
                    warn!(target: "rfix::policy", fragment = %f, host = host.as_str(), error = %e, "conflict_fetch_failed");
                    failures += 1;
                }
                Ok(Fetched::Rejected) => rejects += 1,
                Ok(Fetched::Value(n)) => {
                    if n < conflict_size && ctx.ha_type == HaType::Quorum {
                        continue;
                    }
                    return FixResult::Success;
                }
            }
        }

        if failures > 0 {
            return if failures == unsupported {
                FixResult::Failed
            } else {
                FixResult::Retry
            };
        }
        if rejects == 0 {
            return FixResult::Success;
        }
        error!(
            target: "rfix::policy",
            partition = ctx.partition_id.0,
            fragment = %f,
            rejects,
            "fast_trust_undetermined"
        );
        FixResult::Failed
    }
}

/// Overwrite the local range with the first peer's full copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdTrustPolicy;

impl RepairPolicy for StdTrustPolicy {
    fn name(&self) -> &'static str {
        "StdTrust"
    }

    fn repair(&self, ctx: &RepairContext<'_>) -> FixResult {
        let f = ctx.fragment;
        match ctx.local_covers_fragment() {
            Ok(true) => {}
            Ok(false) => return FixResult::Success,
            Err(e) => {
                error!(target: "rfix::policy", fragment = %f, error = %e, "local_size_failed");
                return FixResult::Retry;
            }
        }
        if ctx.hosts.is_empty() {
            return FixResult::Failed;
        }

        let (mut rejects, mut failures) = (0_usize, 0_usize);
        for host in &ctx.hosts {
            let mut sink = ctx.extent_sink(f.offset);
            let request = ctx.range_request(f.offset, f.size, false);
            let started = Instant::now();
            let fetched = ctx.replicas.fetch_range(ctx.cx, host, &request, &mut sink);
            debug!(
                target: "rfix::policy",
                fragment = %f,
                host = host.as_str(),
                written = sink.written(),
                elapsed_us = elapsed_us(started),
                "remote_range_fetched"
            );
            match fetched {
                Err(e) => {
                    warn!(
                        target: "rfix::policy",
                        partition = ctx.partition_id.0,
                        fragment = %f,
                        host = host.as_str(),
                        error = %e,
                        "range_fetch_failed"
                    );
                    failures += 1;
                }
                Ok(Fetched::Rejected) => rejects += 1,
                Ok(Fetched::Value(n)) => {
                    if n < f.size && ctx.ha_type == HaType::Quorum {
                        continue;
                    }
                    return FixResult::Success;
                }
            }
        }

        if failures > 0 {
            return FixResult::Retry;
        }
        if rejects == 0 {
            return FixResult::Success;
        }
        error!(
            target: "rfix::policy",
            partition = ctx.partition_id.0,
            fragment = %f,
            rejects,
            "std_trust_undetermined"
        );
        FixResult::Failed
    }
}

/// Stage every peer's copy, vote by CRC, and apply the winner.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdQuorumPolicy;

impl RepairPolicy for StdQuorumPolicy {
    fn name(&self) -> &'static str {
        "StdQuorum"
    }

    fn repair(&self, ctx: &RepairContext<'_>) -> FixResult {
        let f = ctx.fragment;
        let local_crc = match ctx.local_crc() {
            Ok(crc) => crc,
            Err(e) => {
                error!(target: "rfix::policy", fragment = %f, error = %e, "local_crc_failed");
                return FixResult::Retry;
            }
        };
        if local_crc == 0 {
            return FixResult::Success;
        }

        let mut staged: Vec<StagingFile> = Vec::with_capacity(ctx.hosts.len());
        let mut versions: HashMap<u32, Vec<usize>> = HashMap::new();
        for host in &ctx.hosts {
            let mut file =
                match StagingFile::create(ctx.staging_dir, host, f.extent_id, f.offset, f.size) {
                    Ok(file) => file,
                    Err(e) => {
                        error!(target: "rfix::policy", fragment = %f, error = %e, "staging_create_failed");
                        return FixResult::Retry;
                    }
                };
            let request = ctx.range_request(f.offset, f.size, true);
            if let Err(e) = ctx.replicas.fetch_range(ctx.cx, host, &request, &mut file) {
                warn!(target: "rfix::policy", fragment = %f, host = host.as_str(), error = %e, "quorum_fetch_failed");
                continue;
            }
            let crc = file.crc();
            debug!(target: "rfix::policy", fragment = %f, host = host.as_str(), crc, "quorum_version_staged");
            versions.entry(crc).or_default().push(staged.len());
            staged.push(file);
        }

        let quorum = quorum_threshold(ctx.hosts.len());
        let winner = versions
            .iter()
            .find(|(_, holders)| holders.len() >= quorum)
            .map(|(crc, holders)| (*crc, holders[0]));
        let Some((crc, index)) = winner else {
            error!(
                target: "rfix::policy",
                partition = ctx.partition_id.0,
                fragment = %f,
                hosts = ctx.hosts.len(),
                quorum,
                versions = versions.len(),
                "quorum_undetermined"
            );
            return FixResult::Failed;
        };

        if crc != 0 && crc != local_crc {
            let mut sink = ctx.extent_sink(f.offset);
            if let Err(e) = staged[index].apply_to(
                ctx.cx,
                &mut sink,
                f.size,
                ctx.block_size,
                f.extent_id.is_tiny(),
            ) {
                error!(
                    target: "rfix::policy",
                    partition = ctx.partition_id.0,
                    fragment = %f,
                    local_crc,
                    quorum_crc = crc,
                    error = %e,
                    "quorum_apply_failed"
                );
                return FixResult::Retry;
            }
            return FixResult::Success;
        }
        warn!(
            target: "rfix::policy",
            partition = ctx.partition_id.0,
            fragment = %f,
            crc,
            "quorum_version_matches_local_or_empty"
        );
        FixResult::Success
    }
}

fn elapsed_us(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX)
}
