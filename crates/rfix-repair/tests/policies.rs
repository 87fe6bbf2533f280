//! Consistency policies against in-memory peers.

mod common;

use asupersync::Cx;
use common::{BLOCK, Call, FixedPolicy, Harness, Peer, ScriptedReplicas, pattern, peer_with};
use rfix_repair::{
    FastTrustPolicy, RepairContext, RepairPolicy, StdQuorumPolicy, StdTrustPolicy, run_chain,
};
use rfix_extent::{ExtentStore, MemExtentStore, WriteMode};
use rfix_types::{ExtentId, Fingerprint, FixResult, Fragment, HaType, PartitionId};
use std::path::Path;
use std::sync::Arc;

const EXTENT: ExtentId = ExtentId(1025);
const TINY: ExtentId = ExtentId(5);
const LEN: usize = 4 * BLOCK as usize;

fn ctx<'a>(cx: &'a Cx, h: &'a Harness, fragment: Fragment, staging: &'a Path) -> RepairContext<'a> {
    ctx_with_chunk(cx, h, fragment, staging, BLOCK)
}

fn ctx_with_chunk<'a>(
    cx: &'a Cx,
    h: &'a Harness,
    fragment: Fragment,
    staging: &'a Path,
    chunk: u64,
) -> RepairContext<'a> {
    use rfix_repair::Topology;
    RepairContext::new(
        cx,
        PartitionId(1),
        fragment,
        h.topology.remote_hosts(),
        h.topology.ha_type(),
        "/disk0",
        staging,
        chunk,
        h.local.as_ref(),
        h.replicas.as_ref(),
        h.limiter.as_ref(),
    )
}

fn run(policy: &dyn RepairPolicy, h: &Harness, fragment: Fragment) -> FixResult {
    common::init_tracing();
    let cx = Cx::for_testing();
    let dir = tempfile::tempdir().expect("tempdir");
    let staging = dir.path().join(".temp");
    let result = policy.repair(&ctx(&cx, h, fragment, &staging));
    if staging.exists() {
        let leftovers = std::fs::read_dir(&staging).expect("read staging").count();
        assert_eq!(leftovers, 0, "staging files must not outlive the policy");
    }
    result
}

fn local(h: &Harness, extent: ExtentId) -> Vec<u8> {
    h.local.contents(extent).expect("local extent")
}

// ── Fast trust ──────────────────────────────────────────────────────────────

#[test]
fn fast_trust_matching_fingerprints_write_nothing() {
    let data = pattern(LEN, 1);
    let h = Harness::new(
        &["h1"],
        HaType::Standard,
        ScriptedReplicas::new([("h1", peer_with(EXTENT, data.clone()))]),
    );
    h.local.put(EXTENT, data);
    let result = run(&FastTrustPolicy, &h, Fragment::new(EXTENT, 0, LEN as u64));
    assert_eq!(result, FixResult::Success);
    assert_eq!(h.local.write_count(), 0);
    assert_eq!(h.replicas.calls().len(), 1);
}

#[test]
fn fast_trust_refetches_from_first_divergent_block_to_fragment_end() {
    let original = pattern(LEN, 1);
    let mut remote = original.clone();
    // Outside the fragment: must stay untouched locally.
    remote[500] ^= 0xff;
    // Third block differs.
    remote[8192..12288].copy_from_slice(&pattern(4096, 2));

    let h = Harness::new(
        &["h1"],
        HaType::Standard,
        ScriptedReplicas::new([("h1", peer_with(EXTENT, remote.clone()))]),
    );
    h.local.put(EXTENT, original.clone());

    let fragment = Fragment::new(EXTENT, 1000, 15_000);
    assert_eq!(run(&FastTrustPolicy, &h, fragment), FixResult::Success);

    let calls = h.replicas.calls();
    assert_eq!(
        calls[1].1,
        Call::Range {
            offset: 8192,
            size: 16_000 - 8192,
            force: false
        }
    );
    let repaired = local(&h, EXTENT);
    assert_eq!(&repaired[1000..16_000], &remote[1000..16_000]);
    assert_eq!(repaired[500], original[500]);
    assert_eq!(&repaired[16_000..], &original[16_000..]);
}

#[test]
fn fast_trust_locates_conflicts_in_engine_blocks() {
    let good = pattern(LEN, 1);
    let mut torn = good.clone();
    torn[3 * BLOCK as usize..].fill(0xee);
    let h = Harness::new(
        &["h1"],
        HaType::Standard,
        ScriptedReplicas::new([("h1", peer_with(EXTENT, good.clone()))]),
    );
    h.local.put(EXTENT, torn);

    // Configured chunk far larger than the engine's fingerprint blocks.
    common::init_tracing();
    let cx = Cx::for_testing();
    let dir = tempfile::tempdir().expect("tempdir");
    let staging = dir.path().join(".temp");
    let fragment = Fragment::new(EXTENT, 0, LEN as u64);
    let result = FastTrustPolicy.repair(&ctx_with_chunk(&cx, &h, fragment, &staging, 128 * 1024));

    assert_eq!(result, FixResult::Success);
    assert_eq!(
        h.replicas.calls()[1].1,
        Call::Range {
            offset: 3 * BLOCK,
            size: BLOCK,
            force: false
        }
    );
    assert_eq!(local(&h, EXTENT), good);
}

/// Local engine that misreports its fingerprint granularity.
struct CoarseBlocks(MemExtentStore);

impl ExtentStore for CoarseBlocks {
    fn exists(&self, extent: ExtentId) -> bool {
        self.0.exists(extent)
    }

    fn read(&self, cx: &Cx, extent: ExtentId, offset: u64, buf: &mut [u8]) -> rfix_error::Result<()> {
        self.0.read(cx, extent, offset, buf)
    }

    fn write(
        &self,
        cx: &Cx,
        extent: ExtentId,
        offset: u64,
        data: &[u8],
        crc: u32,
        mode: WriteMode,
    ) -> rfix_error::Result<()> {
        self.0.write(cx, extent, offset, data, crc, mode)
    }

    fn fingerprint_block_size(&self) -> u64 {
        1 << 20
    }

    fn fingerprint(
        &self,
        cx: &Cx,
        extent: ExtentId,
        offset: u64,
        size: u64,
        force: bool,
    ) -> rfix_error::Result<Fingerprint> {
        self.0.fingerprint(cx, extent, offset, size, force)
    }

    fn watermark(&self, extent: ExtentId) -> rfix_error::Result<u64> {
        self.0.watermark(extent)
    }

    fn tiny_extent_size(&self, extent: ExtentId) -> rfix_error::Result<u64> {
        self.0.tiny_extent_size(extent)
    }
}

#[test]
fn fast_trust_never_succeeds_on_a_conflict_it_cannot_place() {
    let good = pattern(LEN, 1);
    let mut torn = good.clone();
    torn[3 * BLOCK as usize..].fill(0xee);
    let h = Harness::new(
        &["h1"],
        HaType::Standard,
        ScriptedReplicas::new([("h1", peer_with(EXTENT, good))]),
    );
    let storage = CoarseBlocks(MemExtentStore::new(BLOCK));
    storage.0.put(EXTENT, torn.clone());

    common::init_tracing();
    let cx = Cx::for_testing();
    let dir = tempfile::tempdir().expect("tempdir");
    let staging = dir.path().join(".temp");
    let ctx = RepairContext::new(
        &cx,
        PartitionId(1),
        Fragment::new(EXTENT, 0, LEN as u64),
        vec!["h1".to_owned()],
        HaType::Standard,
        "/disk0",
        &staging,
        BLOCK,
        &storage,
        h.replicas.as_ref(),
        h.limiter.as_ref(),
    );

    assert_eq!(FastTrustPolicy.repair(&ctx), FixResult::Failed);
    assert_eq!(storage.0.contents(EXTENT).expect("extent"), torn);
    assert_eq!(storage.0.write_count(), 0);
}

#[test]
fn fast_trust_empty_local_needs_nothing() {
    let h = Harness::new(&["h1"], HaType::Standard, ScriptedReplicas::new([]));
    let result = run(&FastTrustPolicy, &h, Fragment::new(EXTENT, 0, 4096));
    assert_eq!(result, FixResult::Success);
    assert!(h.replicas.calls().is_empty());
}

#[test]
fn fast_trust_remote_without_data_depends_on_ha_type() {
    let data = pattern(LEN, 1);
    let fragment = Fragment::new(EXTENT, 0, LEN as u64);

    // Standard: one peer saying "nothing here" settles it.
    let h = Harness::new(
        &["empty"],
        HaType::Standard,
        ScriptedReplicas::new([("empty", Peer::Store(Arc::default()))]),
    );
    h.local.put(EXTENT, data.clone());
    assert_eq!(run(&FastTrustPolicy, &h, fragment), FixResult::Success);

    // Quorum: the empty peer is skipped and the next one is consulted.
    let mut remote = data.clone();
    remote[0] ^= 0x55;
    let h = Harness::new(
        &["empty", "h2"],
        HaType::Quorum,
        ScriptedReplicas::new([
            ("empty", Peer::Store(Arc::default())),
            ("h2", peer_with(EXTENT, remote.clone())),
        ]),
    );
    h.local.put(EXTENT, data);
    assert_eq!(run(&FastTrustPolicy, &h, fragment), FixResult::Success);
    assert_eq!(local(&h, EXTENT), remote);
}

#[test]
fn fast_trust_error_accounting() {
    let data = pattern(LEN, 1);
    let fragment = Fragment::new(EXTENT, 0, LEN as u64);
    let cases: [(&[(&'static str, &str)], FixResult); 4] = [
        (&[("a", "unknown opcode"), ("b", "unknown opcode")], FixResult::Failed),
        (&[("a", "unknown opcode"), ("b", "connection reset")], FixResult::Retry),
        (&[("a", "operation disabled"), ("b", "operation disabled")], FixResult::Failed),
        (&[("a", "operation disabled"), ("b", "extent 1025 does not exist")], FixResult::Success),
    ];
    for (peers, expected) in cases {
        let hosts: Vec<&str> = peers.iter().map(|(h, _)| *h).collect();
        let h = Harness::new(
            &hosts,
            HaType::Standard,
            ScriptedReplicas::new(
                peers
                    .iter()
                    .map(|(host, msg)| (*host, Peer::Error((*msg).to_owned()))),
            ),
        );
        h.local.put(EXTENT, data.clone());
        assert_eq!(run(&FastTrustPolicy, &h, fragment), expected, "peers {peers:?}");
    }
}

#[test]
fn fast_trust_declines_tiny_extents_and_empty_topology() {
    let h = Harness::new(&["h1"], HaType::Standard, ScriptedReplicas::new([]));
    h.local.put(TINY, pattern(LEN, 1));
    assert_eq!(
        run(&FastTrustPolicy, &h, Fragment::new(TINY, 0, 4096)),
        FixResult::Failed
    );
    assert!(h.replicas.calls().is_empty());

    let h = Harness::new(&[], HaType::Standard, ScriptedReplicas::new([]));
    h.local.put(EXTENT, pattern(LEN, 1));
    assert_eq!(
        run(&FastTrustPolicy, &h, Fragment::new(EXTENT, 0, 4096)),
        FixResult::Failed
    );
}

// ── Standard trust ──────────────────────────────────────────────────────────

#[test]
fn std_trust_skips_ranges_not_covered_locally() {
    let h = Harness::new(&["h1"], HaType::Standard, ScriptedReplicas::new([]));
    assert_eq!(
        run(&StdTrustPolicy, &h, Fragment::new(EXTENT, 0, 4096)),
        FixResult::Success
    );
    h.local.put(EXTENT, pattern(1000, 1));
    assert_eq!(
        run(&StdTrustPolicy, &h, Fragment::new(EXTENT, 0, 4096)),
        FixResult::Success
    );
    assert!(h.replicas.calls().is_empty());
}

#[test]
fn std_trust_overwrites_from_first_answering_peer() {
    let remote = pattern(LEN, 7);
    let h = Harness::new(
        &["off", "h2"],
        HaType::Standard,
        ScriptedReplicas::new([
            ("off", Peer::Error("operation disabled".to_owned())),
            ("h2", peer_with(EXTENT, remote.clone())),
        ]),
    );
    h.local.put(EXTENT, pattern(LEN, 1));
    assert_eq!(
        run(&StdTrustPolicy, &h, Fragment::new(EXTENT, 0, LEN as u64)),
        FixResult::Success
    );
    assert_eq!(local(&h, EXTENT), remote);
}

#[test]
fn std_trust_quorum_mode_skips_short_reads() {
    let full = pattern(LEN, 9);
    let h = Harness::new(
        &["short", "full"],
        HaType::Quorum,
        ScriptedReplicas::new([
            ("short", peer_with(EXTENT, pattern(LEN / 2, 3))),
            ("full", peer_with(EXTENT, full.clone())),
        ]),
    );
    h.local.put(EXTENT, pattern(LEN, 1));
    assert_eq!(
        run(&StdTrustPolicy, &h, Fragment::new(EXTENT, 0, LEN as u64)),
        FixResult::Success
    );
    let ranges = h
        .replicas
        .calls()
        .iter()
        .filter(|(_, c)| matches!(c, Call::Range { .. }))
        .count();
    assert_eq!(ranges, 2);
    assert_eq!(local(&h, EXTENT), full);
}

#[test]
fn std_trust_verdicts_without_a_copy() {
    let fragment = Fragment::new(EXTENT, 0, 4096);
    let cases: [(&[(&'static str, &str)], FixResult); 2] = [
        (&[("a", "disk broken"), ("b", "operation disabled")], FixResult::Retry),
        (&[("a", "operation disabled"), ("b", "operation disabled")], FixResult::Failed),
    ];
    for (peers, expected) in cases {
        let hosts: Vec<&str> = peers.iter().map(|(h, _)| *h).collect();
        let h = Harness::new(
            &hosts,
            HaType::Standard,
            ScriptedReplicas::new(
                peers
                    .iter()
                    .map(|(host, msg)| (*host, Peer::Error((*msg).to_owned()))),
            ),
        );
        h.local.put(EXTENT, pattern(LEN, 1));
        assert_eq!(run(&StdTrustPolicy, &h, fragment), expected, "peers {peers:?}");
    }

    let h = Harness::new(&[], HaType::Standard, ScriptedReplicas::new([]));
    h.local.put(EXTENT, pattern(LEN, 1));
    assert_eq!(run(&StdTrustPolicy, &h, fragment), FixResult::Failed);
}

// ── Quorum ──────────────────────────────────────────────────────────────────

fn quorum_harness(versions: &[(&'static str, Vec<u8>)]) -> Harness {
    let hosts: Vec<&str> = versions.iter().map(|(h, _)| *h).collect();
    let h = Harness::new(
        &hosts,
        HaType::Standard,
        ScriptedReplicas::new(
            versions
                .iter()
                .map(|(host, data)| (*host, peer_with(EXTENT, data.clone()))),
        ),
    );
    h.local.put(EXTENT, pattern(LEN, 1));
    h
}

#[test]
fn quorum_threshold_is_exact() {
    let a = pattern(LEN, 2);
    let b = pattern(LEN, 3);
    let c = pattern(LEN, 4);
    let fragment = Fragment::new(EXTENT, 0, LEN as u64);

    // Three hosts need three votes.
    let h = quorum_harness(&[("h1", a.clone()), ("h2", a.clone()), ("h3", b.clone())]);
    assert_eq!(run(&StdQuorumPolicy, &h, fragment), FixResult::Failed);
    assert_eq!(local(&h, EXTENT), pattern(LEN, 1));

    let h = quorum_harness(&[("h1", a.clone()), ("h2", b.clone()), ("h3", c)]);
    assert_eq!(run(&StdQuorumPolicy, &h, fragment), FixResult::Failed);

    // Two hosts need two.
    let h = quorum_harness(&[("h1", a.clone()), ("h2", a.clone())]);
    assert_eq!(run(&StdQuorumPolicy, &h, fragment), FixResult::Success);
    assert_eq!(local(&h, EXTENT), a);

    // Four hosts need three.
    let h = quorum_harness(&[
        ("h1", b.clone()),
        ("h2", a.clone()),
        ("h3", a.clone()),
        ("h4", a.clone()),
    ]);
    assert_eq!(run(&StdQuorumPolicy, &h, fragment), FixResult::Success);
    assert_eq!(local(&h, EXTENT), a);

    // Ranges were fetched with force set.
    assert!(h
        .replicas
        .calls()
        .iter()
        .all(|(_, c)| matches!(c, Call::Range { force: true, .. })));
}

#[test]
fn quorum_matching_local_writes_nothing() {
    let fragment = Fragment::new(EXTENT, 0, LEN as u64);
    let same = pattern(LEN, 1);
    let h = quorum_harness(&[("h1", same.clone()), ("h2", same)]);
    assert_eq!(run(&StdQuorumPolicy, &h, fragment), FixResult::Success);
    assert_eq!(h.local.write_count(), 0);
}

#[test]
fn quorum_without_local_data_succeeds_immediately() {
    let h = Harness::new(&[], HaType::Standard, ScriptedReplicas::new([]));
    assert_eq!(
        run(&StdQuorumPolicy, &h, Fragment::new(EXTENT, 0, 4096)),
        FixResult::Success
    );
}

#[test]
fn quorum_with_no_hosts_fails() {
    let h = Harness::new(&[], HaType::Standard, ScriptedReplicas::new([]));
    h.local.put(EXTENT, pattern(LEN, 1));
    assert_eq!(
        run(&StdQuorumPolicy, &h, Fragment::new(EXTENT, 0, 4096)),
        FixResult::Failed
    );
}

#[test]
fn quorum_on_tiny_extent_leaves_holes_untouched() {
    let original = pattern(8192, 1);
    let mut remote = pattern(8192, 3);
    remote[2000..5000].fill(0);

    let h = Harness::new(
        &["h1", "h2"],
        HaType::Standard,
        ScriptedReplicas::new([
            ("h1", peer_with(TINY, remote.clone())),
            ("h2", peer_with(TINY, remote.clone())),
        ]),
    );
    h.local.put(TINY, original.clone());

    assert_eq!(
        run(&StdQuorumPolicy, &h, Fragment::new(TINY, 0, 8192)),
        FixResult::Success
    );
    let repaired = local(&h, TINY);
    assert_eq!(&repaired[..2000], &remote[..2000]);
    assert_eq!(&repaired[2000..5000], &original[2000..5000]);
    assert_eq!(&repaired[5000..], &remote[5000..]);
}

#[test]
fn quorum_apply_failure_is_retry() {
    let a = pattern(LEN, 2);
    let h = quorum_harness(&[("h1", a.clone()), ("h2", a)]);
    h.local.set_fail_writes(true);
    assert_eq!(
        run(&StdQuorumPolicy, &h, Fragment::new(EXTENT, 0, LEN as u64)),
        FixResult::Retry
    );
}

// ── Chain ───────────────────────────────────────────────────────────────────

#[test]
fn chain_stops_at_retry_and_success() {
    let h = Harness::new(&[], HaType::Standard, ScriptedReplicas::new([]));
    let cx = Cx::for_testing();
    let dir = tempfile::tempdir().expect("tempdir");
    let fragment = Fragment::new(EXTENT, 0, 4096);

    let failed = FixedPolicy::new("F", FixResult::Failed);
    let retry = FixedPolicy::new("R", FixResult::Retry);
    let last = FixedPolicy::new("S", FixResult::Success);
    let chain: Vec<Arc<dyn RepairPolicy>> = vec![failed.clone(), retry.clone(), last.clone()];
    assert_eq!(
        run_chain(&chain, &ctx(&cx, &h, fragment, dir.path())),
        FixResult::Retry
    );
    assert_eq!((failed.calls(), retry.calls(), last.calls()), (1, 1, 0));

    let chain: Vec<Arc<dyn RepairPolicy>> = vec![failed.clone(), failed.clone()];
    assert_eq!(
        run_chain(&chain, &ctx(&cx, &h, fragment, dir.path())),
        FixResult::Failed
    );
    assert_eq!(failed.calls(), 3);
}
