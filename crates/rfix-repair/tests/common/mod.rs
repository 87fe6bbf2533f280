#![allow(dead_code)]

use asupersync::Cx;
use parking_lot::Mutex;
use rfix_error::{Result, RfixError};
use rfix_extent::{ExtentStore, MemExtentStore};
use rfix_repair::{
    DiskConcurrencyLimiter, Fetched, FingerprintRequest, FixerStatus, IoLimiter, RangeCursor,
    RangeReply, RangeRequest, RangeSink, RecordingAlerter, RepairEnv, RepairPolicy, ReplicaClient,
    StaticTopology, Unlimited, classify_remote_error,
};
use rfix_types::{ExtentId, Fingerprint, FixResult, Fragment, HaType};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

pub const BLOCK: u64 = 4096;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `cond` until it holds or ten seconds pass.
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

pub fn wait_idle(status: impl Fn() -> FixerStatus) {
    wait_until("workers to exit", || !status().running);
}

/// How a scripted peer answers.
#[derive(Clone)]
pub enum Peer {
    /// Serve from this store.
    Store(Arc<MemExtentStore>),
    /// Answer every request with this failure text.
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Fingerprint { offset: u64, size: u64 },
    Range { offset: u64, size: u64, force: bool },
}

/// Replica client over in-memory peers. Range replies are streamed in
/// `chunk`-sized packets; for tiny extents all-zero packets go out as hole
/// markers.
pub struct ScriptedReplicas {
    peers: HashMap<String, Peer>,
    chunk: usize,
    calls: Mutex<Vec<(String, Call)>>,
}

impl ScriptedReplicas {
    pub fn new(peers: impl IntoIterator<Item = (&'static str, Peer)>) -> Self {
        Self {
            peers: peers.into_iter().map(|(h, p)| (h.to_owned(), p)).collect(),
            chunk: 1000,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, Call)> {
        self.calls.lock().clone()
    }

    fn peer(&self, host: &str) -> Result<&Peer> {
        self.peers.get(host).ok_or_else(|| RfixError::Remote {
            host: host.to_owned(),
            detail: "connection refused".to_owned(),
        })
    }
}

impl ReplicaClient for ScriptedReplicas {
    fn fetch_fingerprint(
        &self,
        cx: &Cx,
        host: &str,
        request: &FingerprintRequest,
    ) -> Result<Fetched<Fingerprint>> {
        // Through the wire argument, as a real peer would see it.
        let arg = request.encode_arg();
        let request = FingerprintRequest::decode_arg(request.partition_id, request.extent_id, &arg)?;
        self.calls.lock().push((
            host.to_owned(),
            Call::Fingerprint {
                offset: request.offset,
                size: request.size,
            },
        ));
        let message = match self.peer(host)? {
            Peer::Error(msg) => msg.clone(),
            Peer::Store(store) => {
                match store.fingerprint(cx, request.extent_id, request.offset, request.size, request.force) {
                    Ok(fgp) => {
                        let wire = fgp.encode();
                        return Ok(Fetched::Value(Fingerprint::decode(&wire)?));
                    }
                    Err(e) => e.to_string(),
                }
            }
        };
        Ok(classify_remote_error(host, &message)?.into_fetched(Fingerprint::default()))
    }

    fn fetch_range(
        &self,
        cx: &Cx,
        host: &str,
        request: &RangeRequest,
        sink: &mut dyn RangeSink,
    ) -> Result<Fetched<u64>> {
        self.calls.lock().push((
            host.to_owned(),
            Call::Range {
                offset: request.offset,
                size: request.size,
                force: request.force,
            },
        ));
        let store = match self.peer(host)? {
            Peer::Error(msg) => {
                return Ok(classify_remote_error(host, msg)?.into_fetched(0));
            }
            Peer::Store(store) => store,
        };
        let Some(data) = store.contents(request.extent_id) else {
            let msg = RfixError::ExtentNotFound(request.extent_id.0).to_string();
            return Ok(classify_remote_error(host, &msg)?.into_fetched(0));
        };
        let start = usize::try_from(request.offset).unwrap_or(usize::MAX);
        if start >= data.len() {
            return Ok(classify_remote_error(host, "EOF")?.into_fetched(0));
        }
        let end = start
            .saturating_add(usize::try_from(request.size).unwrap_or(usize::MAX))
            .min(data.len());

        let mut cursor = RangeCursor::new(request.size);
        for packet in data[start..end].chunks(self.chunk) {
            let reply = if request.is_tiny() && packet.iter().all(|b| *b == 0) {
                let (arg, crc) = RangeReply::hole_marker(packet.len() as u64);
                RangeReply::from_packet(true, &arg, crc, &[])?
            } else {
                RangeReply::from_packet(request.is_tiny(), &[], 0, packet)?
            };
            cursor.apply(cx, reply, sink)?;
        }
        Ok(Fetched::Value(cursor.bytes()))
    }
}

/// Policy that always answers the same verdict and counts its calls.
pub struct FixedPolicy {
    pub name: &'static str,
    pub result: FixResult,
    pub calls: AtomicUsize,
}

impl FixedPolicy {
    pub fn new(name: &'static str, result: FixResult) -> Arc<Self> {
        Arc::new(Self {
            name,
            result,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RepairPolicy for FixedPolicy {
    fn name(&self) -> &'static str {
        self.name
    }

    fn repair(&self, _ctx: &rfix_repair::RepairContext<'_>) -> FixResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result
    }
}

/// Policy that records every fragment it sees and succeeds.
#[derive(Default)]
pub struct RecordingPolicy {
    pub seen: Mutex<Vec<Fragment>>,
}

impl RepairPolicy for RecordingPolicy {
    fn name(&self) -> &'static str {
        "Recording"
    }

    fn repair(&self, ctx: &rfix_repair::RepairContext<'_>) -> FixResult {
        self.seen.lock().push(ctx.fragment);
        std::thread::sleep(Duration::from_millis(1));
        FixResult::Success
    }
}

pub struct Harness {
    pub local: Arc<MemExtentStore>,
    pub replicas: Arc<ScriptedReplicas>,
    pub topology: Arc<StaticTopology>,
    pub alerter: Arc<RecordingAlerter>,
    pub limiter: Arc<dyn IoLimiter>,
}

impl Harness {
    pub fn new(hosts: &[&str], ha_type: HaType, replicas: ScriptedReplicas) -> Self {
        Self {
            local: Arc::new(MemExtentStore::new(BLOCK)),
            replicas: Arc::new(replicas),
            topology: Arc::new(StaticTopology::new(
                hosts.iter().map(|h| (*h).to_owned()).collect(),
                ha_type,
            )),
            alerter: Arc::new(RecordingAlerter::default()),
            limiter: Arc::new(Unlimited),
        }
    }

    pub fn with_limiter(mut self, limiter: Arc<DiskConcurrencyLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn env(&self) -> RepairEnv {
        RepairEnv {
            storage: self.local.clone(),
            replicas: self.replicas.clone(),
            topology: self.topology.clone(),
            limiter: self.limiter.clone(),
            alerter: self.alerter.clone(),
        }
    }
}

pub fn peer_with(extent: ExtentId, data: Vec<u8>) -> Peer {
    let store = MemExtentStore::new(BLOCK);
    store.put(extent, data);
    Peer::Store(Arc::new(store))
}

/// `len` bytes whose value depends on position and `seed`.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) | 1)
        .collect()
}
