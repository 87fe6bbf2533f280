//! Per-partition repair orchestrator.
//!
//! # Locking
//!
//! Three independent locks keep slow repair I/O away from metadata queries:
//!
//! - **index** (`RwLock`): live fragments and their ledger offsets. Readers
//!   are `status`, `find_overlap` and `fragment_count`; writers are
//!   register and unregister. Ledger appends and the final compaction happen
//!   under the write lock, so a compaction never races a registration.
//! - **queue** (`Mutex`, inside [`RepairQueue`]): fragments not checked out.
//! - **ledger I/O** (`Mutex`, inside [`FragmentLedger`]).
//!
//! A fourth lock, **run**, serializes `start`, `stop` and `status`.
//!
//! # Crash behavior
//!
//! A fragment leaves the ledger only after a policy chain returned
//! `Success` and its slot was durably tombstoned. A crash at any other point
//! leaves it in the ledger, and the next [`Fixer::open`] requeues it.

use asupersync::Cx;
use parking_lot::{Mutex, RwLock};
use rfix_error::{Result, RfixError};
use rfix_extent::ExtentStore;
use rfix_types::{ExtentId, FixResult, Fragment, PartitionId};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::backtrace::Backtrace;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::alert::{Alerter, unfixable_message, worker_panic_message};
use crate::config::FixerConfig;
use crate::ledger::{FragmentIndexEntry, FragmentLedger, LedgerStats};
use crate::limiter::{ConcurrencyPermit, IoLimiter, RepairOp};
use crate::policy::{RepairContext, RepairPolicy, default_policies, run_chain};
use crate::queue::RepairQueue;
use crate::topology::Topology;
use crate::transport::ReplicaClient;

/// Collaborators a fixer borrows from its owning node.
#[derive(Clone)]
pub struct RepairEnv {
    pub storage: Arc<dyn ExtentStore>,
    pub replicas: Arc<dyn ReplicaClient>,
    pub topology: Arc<dyn Topology>,
    pub limiter: Arc<dyn IoLimiter>,
    pub alerter: Arc<dyn Alerter>,
}

impl fmt::Debug for RepairEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepairEnv").finish_non_exhaustive()
    }
}

/// Identity and tuning of one fixer.
#[derive(Clone)]
pub struct FixerOptions {
    pub partition_id: PartitionId,
    /// Partition directory holding the ledger and the staging directory.
    pub path: PathBuf,
    /// Disk the partition lives on; the limiter's key.
    pub disk_path: String,
    pub config: FixerConfig,
    pub policies: Vec<Arc<dyn RepairPolicy>>,
}

impl FixerOptions {
    #[must_use]
    pub fn new(partition_id: PartitionId, path: impl Into<PathBuf>, disk_path: impl Into<String>) -> Self {
        Self {
            partition_id,
            path: path.into(),
            disk_path: disk_path.into(),
            config: FixerConfig::default(),
            policies: default_policies(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: FixerConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the policy chain.
    #[must_use]
    pub fn with_policies(mut self, policies: Vec<Arc<dyn RepairPolicy>>) -> Self {
        self.policies = policies;
        self
    }
}

impl fmt::Debug for FixerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixerOptions")
            .field("partition_id", &self.partition_id)
            .field("path", &self.path)
            .field("disk_path", &self.disk_path)
            .field("config", &self.config)
            .field(
                "policies",
                &self.policies.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// One outstanding fragment, as reported by [`Fixer::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentView {
    #[serde(rename = "ExtentID")]
    pub extent_id: u64,
    #[serde(rename = "Offset")]
    pub offset: u64,
    #[serde(rename = "Size")]
    pub size: u64,
}

impl From<Fragment> for FragmentView {
    fn from(f: Fragment) -> Self {
        Self {
            extent_id: f.extent_id.0,
            offset: f.offset,
            size: f.size,
        }
    }
}

/// Status snapshot in the node's status endpoint shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FixerStatus {
    pub fragments: Vec<FragmentView>,
    pub count: usize,
    pub running: bool,
}

/// Outcome counters since open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixerStats {
    pub fixed: u64,
    pub retried: u64,
    pub failed: u64,
    pub panics: u64,
}

#[derive(Debug, Default)]
struct Counters {
    fixed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    panics: AtomicU64,
}

#[derive(Debug, Default)]
struct RunState {
    cancel: Option<Arc<AtomicBool>>,
    generation: u64,
}

struct Shared {
    partition_id: PartitionId,
    disk_path: String,
    staging_dir: PathBuf,
    config: FixerConfig,
    policies: Vec<Arc<dyn RepairPolicy>>,
    env: RepairEnv,
    index: RwLock<Vec<FragmentIndexEntry>>,
    queue: RepairQueue,
    ledger: FragmentLedger,
    run: Mutex<RunState>,
    workers: AtomicUsize,
    counters: Counters,
}

/// Repair orchestrator for one partition.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Fixer {
    shared: Arc<Shared>,
}

impl fmt::Debug for Fixer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fixer")
            .field("partition_id", &self.shared.partition_id)
            .field("fragments", &self.fragment_count())
            .field("workers", &self.shared.workers.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Fixer {
    /// Load the partition's ledger, merge `initial_fragments` into it, and
    /// queue everything outstanding. Workers are not started.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid, the ledger is corrupt or
    /// unreadable, or registering an initial fragment fails.
    pub fn open(
        cx: &Cx,
        options: FixerOptions,
        env: RepairEnv,
        initial_fragments: impl IntoIterator<Item = Fragment>,
    ) -> Result<Self> {
        cx.checkpoint().map_err(|_| RfixError::Cancelled)?;
        options.config.validate()?;
        let FixerOptions {
            partition_id,
            path,
            disk_path,
            config,
            policies,
        } = options;

        let ledger = FragmentLedger::new(path.join(&config.ledger_file_name), config.sync_on_append);
        let entries = ledger.load()?;
        let queue = RepairQueue::new();
        queue.push_all(entries.iter().map(|e| e.fragment));
        let loaded = entries.len();

        let fixer = Self {
            shared: Arc::new(Shared {
                partition_id,
                disk_path,
                staging_dir: path.join(&config.staging_dir_name),
                config,
                policies,
                env,
                index: RwLock::new(entries),
                queue,
                ledger,
                run: Mutex::new(RunState::default()),
                workers: AtomicUsize::new(0),
                counters: Counters::default(),
            }),
        };

        for fragment in initial_fragments {
            fixer.register_risk(fragment)?;
        }
        if fixer.fragment_count() == 0 {
            if let Err(e) = fixer.shared.ledger.compact() {
                warn!(target: "rfix::repair", partition = partition_id.0, error = %e, "ledger_compact_failed");
            }
        }
        info!(
            target: "rfix::repair",
            partition = partition_id.0,
            path = %path.display(),
            loaded,
            outstanding = fixer.fragment_count(),
            "fixer_opened"
        );
        Ok(fixer)
    }

    #[must_use]
    pub fn partition_id(&self) -> PartitionId {
        self.shared.partition_id
    }

    /// Record `fragment` as suspect: append it to the ledger, index it and
    /// queue it. Already-tracked fragments and empty ranges are ignored.
    ///
    /// # Errors
    ///
    /// A failed ledger append leaves nothing registered; the caller must
    /// retry the registration.
    pub fn register_risk(&self, fragment: Fragment) -> Result<()> {
        self.shared.register(fragment)
    }

    /// Drop every index entry equal to `fragment`, tombstoning each ledger
    /// slot first. Compacts the ledger once nothing is outstanding.
    ///
    /// # Errors
    ///
    /// Fails only when a tombstone could not be written; the entries whose
    /// slots were not erased stay registered. A failed compaction is logged.
    pub fn unregister_risk(&self, fragment: &Fragment) -> Result<()> {
        self.shared.unregister(fragment)
    }

    /// Spawn workers for the current backlog unless some are running.
    pub fn start(&self) -> Result<()> {
        let mut run = self.shared.run.lock();
        if self.shared.workers.load(Ordering::Acquire) > 0 {
            return Ok(());
        }
        let backlog = self.shared.queue.len();
        if backlog == 0 {
            return Ok(());
        }
        let count = self.shared.config.worker_count(backlog);
        let cancel = Arc::new(AtomicBool::new(false));
        run.cancel = Some(Arc::clone(&cancel));
        run.generation += 1;

        for id in 0..count {
            self.shared.workers.fetch_add(1, Ordering::AcqRel);
            let shared = Arc::clone(&self.shared);
            let cancel = Arc::clone(&cancel);
            let spawned = std::thread::Builder::new()
                .name(format!("rfix-p{}-w{id}", self.shared.partition_id))
                .spawn(move || worker_main(shared, cancel, id));
            if let Err(e) = spawned {
                self.shared.workers.fetch_sub(1, Ordering::AcqRel);
                error!(target: "rfix::repair", partition = self.shared.partition_id.0, worker = id, error = %e, "worker_spawn_failed");
                return Err(e.into());
            }
        }
        info!(
            target: "rfix::repair",
            partition = self.shared.partition_id.0,
            backlog,
            workers = count,
            generation = run.generation,
            "workers_started"
        );
        Ok(())
    }

    /// Signal running workers to exit after their current fragment.
    /// Does not wait for them.
    pub fn stop(&self) {
        let mut run = self.shared.run.lock();
        if let Some(cancel) = run.cancel.take() {
            cancel.store(true, Ordering::Release);
            info!(target: "rfix::repair", partition = self.shared.partition_id.0, generation = run.generation, "workers_stop_requested");
        }
    }

    #[must_use]
    pub fn status(&self) -> FixerStatus {
        let _run = self.shared.run.lock();
        let fragments: Vec<FragmentView> = self
            .shared
            .index
            .read()
            .iter()
            .map(|e| FragmentView::from(e.fragment))
            .collect();
        FixerStatus {
            count: fragments.len(),
            fragments,
            running: self.shared.workers.load(Ordering::Acquire) > 0,
        }
    }

    /// Whether any outstanding fragment intersects the range. Advisory only.
    #[must_use]
    pub fn find_overlap(&self, extent_id: ExtentId, offset: u64, size: u64) -> bool {
        self.shared
            .index
            .read()
            .iter()
            .any(|e| e.fragment.overlaps(extent_id, offset, size))
    }

    #[must_use]
    pub fn fragment_count(&self) -> usize {
        self.shared.index.read().len()
    }

    /// Fragments waiting in the queue, front first.
    #[must_use]
    pub fn queued(&self) -> Vec<Fragment> {
        self.shared.queue.snapshot()
    }

    #[must_use]
    pub fn stats(&self) -> FixerStats {
        let c = &self.shared.counters;
        FixerStats {
            fixed: c.fixed.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            panics: c.panics.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn ledger_stats(&self) -> LedgerStats {
        self.shared.ledger.stats()
    }

    #[must_use]
    pub fn ledger_path(&self) -> &Path {
        self.shared.ledger.path()
    }
}

impl Shared {
    fn register(&self, fragment: Fragment) -> Result<()> {
        if fragment.size == 0 {
            debug!(target: "rfix::repair", partition = self.partition_id.0, %fragment, "empty_fragment_ignored");
            return Ok(());
        }
        {
            let mut index = self.index.write();
            if index.iter().any(|e| e.fragment == fragment) {
                return Ok(());
            }
            let log_offset = self.ledger.append(&fragment)?;
            index.push(FragmentIndexEntry {
                fragment,
                log_offset,
            });
        }
        self.queue.push(fragment);
        debug!(target: "rfix::repair", partition = self.partition_id.0, %fragment, "risk_registered");
        Ok(())
    }

    fn unregister(&self, fragment: &Fragment) -> Result<()> {
        let offsets: Vec<u64> = self
            .index
            .read()
            .iter()
            .filter(|e| e.fragment == *fragment)
            .map(|e| e.log_offset)
            .collect();

        let mut erased = Vec::with_capacity(offsets.len());
        let mut failure = None;
        for offset in offsets {
            match self.ledger.erase(offset) {
                Ok(()) => erased.push(offset),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let mut index = self.index.write();
        index.retain(|e| !(e.fragment == *fragment && erased.contains(&e.log_offset)));
        if let Some(e) = failure {
            error!(target: "rfix::repair", partition = self.partition_id.0, %fragment, error = %e, "risk_unregister_failed");
            return Err(e);
        }
        debug!(target: "rfix::repair", partition = self.partition_id.0, %fragment, "risk_unregistered");
        // Tombstones are already durable; a later open compacts what this misses.
        if index.is_empty() {
            if let Err(e) = self.ledger.compact() {
                warn!(target: "rfix::repair", partition = self.partition_id.0, error = %e, "ledger_compact_failed");
            }
        }
        Ok(())
    }

    fn check_and_fix(&self, cx: &Cx, fragment: Fragment) -> FixResult {
        let _permit = match ConcurrencyPermit::acquire(
            Arc::clone(&self.env.limiter),
            RepairOp::RepairWrite,
            &self.disk_path,
        ) {
            Ok(permit) => permit,
            Err(e) => {
                debug!(target: "rfix::repair", partition = self.partition_id.0, %fragment, error = %e, "repair_permit_unavailable");
                return FixResult::Retry;
            }
        };
        let ctx = RepairContext::new(
            cx,
            self.partition_id,
            fragment,
            self.env.topology.remote_hosts(),
            self.env.topology.ha_type(),
            &self.disk_path,
            &self.staging_dir,
            self.config.block_size,
            self.env.storage.as_ref(),
            self.env.replicas.as_ref(),
            self.env.limiter.as_ref(),
        );
        run_chain(&self.policies, &ctx)
    }
}

/// Returns a checked-out fragment to the queue and releases the worker slot
/// however the worker exits.
struct WorkerGuard {
    shared: Arc<Shared>,
    id: usize,
    held: Option<Fragment>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if let Some(fragment) = self.held.take() {
            self.shared.queue.push(fragment);
        }
        self.shared.workers.fetch_sub(1, Ordering::AcqRel);
        info!(target: "rfix::repair", partition = self.shared.partition_id.0, worker = self.id, "worker_exited");
    }
}

fn worker_main(shared: Arc<Shared>, cancel: Arc<AtomicBool>, id: usize) {
    let partition_id = shared.partition_id;
    let alerter = Arc::clone(&shared.env.alerter);
    let counters_owner = Arc::clone(&shared);
    let outcome = panic::catch_unwind(AssertUnwindSafe(move || {
        let mut guard = WorkerGuard {
            shared,
            id,
            held: None,
        };
        worker_loop(&mut guard, &cancel);
    }));
    if let Err(payload) = outcome {
        let message = panic_message(payload.as_ref());
        error!(
            target: "rfix::repair",
            partition = partition_id.0,
            worker = id,
            panic = %message,
            backtrace = %Backtrace::force_capture(),
            "worker_panicked"
        );
        alerter.warn(&worker_panic_message(partition_id, &message));
        counters_owner.counters.panics.fetch_add(1, Ordering::Relaxed);
    }
}

fn worker_loop(guard: &mut WorkerGuard, cancel: &AtomicBool) {
    let shared = Arc::clone(&guard.shared);
    let cx = Cx::for_request();
    debug!(target: "rfix::repair", partition = shared.partition_id.0, worker = guard.id, "worker_started");
    loop {
        if cancel.load(Ordering::Acquire) {
            return;
        }
        let Some(fragment) = shared.queue.pop() else {
            return;
        };
        guard.held = Some(fragment);

        let started = Instant::now();
        let result = shared.check_and_fix(&cx, fragment);
        match result {
            FixResult::Retry => {
                shared.counters.retried.fetch_add(1, Ordering::Relaxed);
                error!(target: "rfix::repair", partition = shared.partition_id.0, worker = guard.id, %fragment, "fix_deferred_for_retry");
                if let Some(held) = guard.held.take() {
                    shared.queue.push(held);
                }
            }
            FixResult::Failed => {
                shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(target: "rfix::repair", partition = shared.partition_id.0, worker = guard.id, %fragment, "fix_failed");
                shared
                    .env
                    .alerter
                    .warn(&unfixable_message(shared.partition_id, &fragment));
                // Stays registered; only the queue forgets it.
                guard.held = None;
            }
            FixResult::Success => {
                if let Err(e) = shared.unregister(&fragment) {
                    error!(target: "rfix::repair", partition = shared.partition_id.0, worker = guard.id, %fragment, error = %e, "worker_aborted");
                    return;
                }
                guard.held = None;
                shared.counters.fixed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    target: "rfix::repair",
                    partition = shared.partition_id.0,
                    worker = guard.id,
                    %fragment,
                    elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
                    "fragment_fixed"
                );
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
