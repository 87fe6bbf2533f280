//! Disk I/O admission for repair traffic.
//!
//! Repair competes with client I/O on the same disk, so every local write and
//! CRC read is admitted by an [`IoLimiter`] first. A fragment's whole policy
//! chain runs under one [`RepairOp::RepairWrite`] concurrency permit per disk.

use parking_lot::Mutex;
use rfix_error::{Result, RfixError};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Repair I/O classes the limiter distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepairOp {
    /// Writing repaired bytes into a local extent.
    RepairWrite,
    /// Reading local bytes to compute a CRC.
    RepairReadCrc,
}

impl fmt::Display for RepairOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RepairWrite => write!(f, "repair_write"),
            Self::RepairReadCrc => write!(f, "repair_read_crc"),
        }
    }
}

/// Concurrency and bandwidth gate keyed by disk path.
pub trait IoLimiter: Send + Sync {
    /// Take one concurrency slot for `op` on `disk_path`.
    ///
    /// Fails with [`RfixError::LimiterUnavailable`] instead of blocking when
    /// the disk is saturated.
    fn acquire_concurrency(&self, op: RepairOp, disk_path: &str) -> Result<()>;

    /// Return a slot taken by [`IoLimiter::acquire_concurrency`].
    fn release_concurrency(&self, op: RepairOp, disk_path: &str);

    /// Admit `bytes` of `op` traffic on `disk_path`, blocking while the
    /// disk's bandwidth budget is spent.
    fn wait_flow(&self, op: RepairOp, bytes: u64, disk_path: &str) -> Result<()>;
}

/// RAII concurrency slot.
pub struct ConcurrencyPermit {
    limiter: Arc<dyn IoLimiter>,
    op: RepairOp,
    disk_path: String,
}

impl ConcurrencyPermit {
    pub fn acquire(limiter: Arc<dyn IoLimiter>, op: RepairOp, disk_path: &str) -> Result<Self> {
        limiter.acquire_concurrency(op, disk_path)?;
        Ok(Self {
            limiter,
            op,
            disk_path: disk_path.to_owned(),
        })
    }
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.limiter.release_concurrency(self.op, &self.disk_path);
    }
}

impl fmt::Debug for ConcurrencyPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyPermit")
            .field("op", &self.op)
            .field("disk_path", &self.disk_path)
            .finish()
    }
}

/// Limiter that admits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

impl IoLimiter for Unlimited {
    fn acquire_concurrency(&self, _op: RepairOp, _disk_path: &str) -> Result<()> {
        Ok(())
    }

    fn release_concurrency(&self, _op: RepairOp, _disk_path: &str) {}

    fn wait_flow(&self, _op: RepairOp, _bytes: u64, _disk_path: &str) -> Result<()> {
        Ok(())
    }
}

const FLOW_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct FlowWindow {
    started: Instant,
    used: u64,
}

#[derive(Debug, Default)]
struct DiskState {
    in_flight: HashMap<RepairOp, usize>,
    flow: Option<FlowWindow>,
}

/// Per-disk limiter with a fixed number of concurrent repairs and an optional
/// bytes-per-second budget.
#[derive(Debug)]
pub struct DiskConcurrencyLimiter {
    max_concurrent: usize,
    bytes_per_sec: Option<u64>,
    disks: Mutex<HashMap<String, DiskState>>,
}

impl DiskConcurrencyLimiter {
    #[must_use]
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            bytes_per_sec: None,
            disks: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_bytes_per_sec(mut self, bytes_per_sec: u64) -> Self {
        self.bytes_per_sec = Some(bytes_per_sec).filter(|b| *b > 0);
        self
    }

    /// Slots of `op` currently held on `disk_path`.
    #[must_use]
    pub fn in_flight(&self, op: RepairOp, disk_path: &str) -> usize {
        self.disks
            .lock()
            .get(disk_path)
            .and_then(|disk| disk.in_flight.get(&op).copied())
            .unwrap_or(0)
    }
}

impl IoLimiter for DiskConcurrencyLimiter {
    fn acquire_concurrency(&self, op: RepairOp, disk_path: &str) -> Result<()> {
        let mut disks = self.disks.lock();
        let held = disks
            .entry(disk_path.to_owned())
            .or_default()
            .in_flight
            .entry(op)
            .or_insert(0);
        if *held >= self.max_concurrent {
            return Err(RfixError::LimiterUnavailable(format!(
                "{op} on {disk_path}: {held} of {} slots in use",
                self.max_concurrent
            )));
        }
        *held += 1;
        Ok(())
    }

    fn release_concurrency(&self, op: RepairOp, disk_path: &str) {
        let mut disks = self.disks.lock();
        if let Some(held) = disks
            .get_mut(disk_path)
            .and_then(|disk| disk.in_flight.get_mut(&op))
        {
            *held = held.saturating_sub(1);
        }
    }

    fn wait_flow(&self, op: RepairOp, bytes: u64, disk_path: &str) -> Result<()> {
        let Some(budget) = self.bytes_per_sec else {
            return Ok(());
        };
        loop {
            let wait = {
                let mut disks = self.disks.lock();
                let disk = disks.entry(disk_path.to_owned()).or_default();
                let now = Instant::now();
                let window = disk.flow.get_or_insert(FlowWindow {
                    started: now,
                    used: 0,
                });
                let elapsed = now.duration_since(window.started);
                if elapsed >= FLOW_WINDOW {
                    window.started = now;
                    window.used = 0;
                }
                // A request larger than the whole budget is admitted into an
                // empty window rather than starved.
                if bytes == 0
                    || window.used == 0
                    || window.used.saturating_add(bytes) <= budget
                {
                    window.used = window.used.saturating_add(bytes);
                    None
                } else {
                    Some(FLOW_WINDOW.saturating_sub(now.duration_since(window.started)))
                }
            };
            match wait {
                None => return Ok(()),
                Some(delay) => {
                    trace!(target: "rfix::repair", %op, disk_path, bytes, ?delay, "flow_limited");
                    std::thread::sleep(delay);
                }
            }
        }
    }
}
