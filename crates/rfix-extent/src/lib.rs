#![forbid(unsafe_code)]
//! Extent storage capability.
//!
//! Repair never owns the storage engine; it borrows one through the
//! [`ExtentStore`] trait and shares it with the normal read/write path. Any
//! per-extent locking is the engine's business. Every I/O method takes a
//! `&Cx` capability context for cooperative cancellation.
//!
//! [`MemExtentStore`] is a complete in-memory engine for embedders that want
//! to exercise repair without real disks, and for tests.

use asupersync::Cx;
use parking_lot::RwLock;
use rfix_error::{Result, RfixError};
use rfix_types::{DEFAULT_BLOCK_SIZE, ExtentId, Fingerprint};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::trace;

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| RfixError::Cancelled)
}

/// How a write lands in the extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteMode {
    /// Must start exactly at the current end of the extent.
    Append,
    /// Overwrites (and if needed extends) at an arbitrary offset.
    Random,
}

/// Storage-engine operations needed to inspect and repair extent data.
pub trait ExtentStore: Send + Sync {
    /// Whether the extent exists locally.
    fn exists(&self, extent: ExtentId) -> bool;

    /// Read exactly `buf.len()` bytes from `offset`.
    ///
    /// Missing extents fail with [`RfixError::ExtentNotFound`]; reads past the
    /// end fail with [`RfixError::Eof`].
    fn read(&self, cx: &Cx, extent: ExtentId, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` at `offset`. `crc` is the CRC-32/IEEE of `data` and is
    /// verified by the engine before the bytes are accepted.
    fn write(
        &self,
        cx: &Cx,
        extent: ExtentId,
        offset: u64,
        data: &[u8],
        crc: u32,
        mode: WriteMode,
    ) -> Result<()>;

    /// Block granularity of [`ExtentStore::fingerprint`]. Peers of one
    /// partition must agree on it for fingerprints to be comparable.
    fn fingerprint_block_size(&self) -> u64;

    /// Per-block fingerprint of `[offset, offset + size)`.
    ///
    /// `force` asks the engine to compute from the data even if it would
    /// normally refuse (for example while the extent is being written).
    fn fingerprint(
        &self,
        cx: &Cx,
        extent: ExtentId,
        offset: u64,
        size: u64,
        force: bool,
    ) -> Result<Fingerprint>;

    /// Committed size of a normal extent.
    fn watermark(&self, extent: ExtentId) -> Result<u64>;

    /// Logical size of a tiny extent, holes included.
    fn tiny_extent_size(&self, extent: ExtentId) -> Result<u64>;
}

/// In-memory [`ExtentStore`].
#[derive(Debug)]
pub struct MemExtentStore {
    extents: RwLock<HashMap<ExtentId, Vec<u8>>>,
    block_size: u64,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

impl Default for MemExtentStore {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

impl MemExtentStore {
    #[must_use]
    pub fn new(block_size: u64) -> Self {
        Self {
            extents: RwLock::new(HashMap::new()),
            block_size,
            fail_writes: AtomicBool::new(false),
            writes: AtomicU64::new(0),
        }
    }

    /// Create or replace an extent with the given contents.
    pub fn put(&self, extent: ExtentId, data: Vec<u8>) {
        self.extents.write().insert(extent, data);
    }

    #[must_use]
    pub fn contents(&self, extent: ExtentId) -> Option<Vec<u8>> {
        self.extents.read().get(&extent).cloned()
    }

    pub fn remove(&self, extent: ExtentId) -> bool {
        self.extents.write().remove(&extent).is_some()
    }

    /// Make every subsequent write fail with an I/O error until cleared.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of writes accepted so far.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }
}

impl ExtentStore for MemExtentStore {
    fn exists(&self, extent: ExtentId) -> bool {
        self.extents.read().contains_key(&extent)
    }

    fn read(&self, cx: &Cx, extent: ExtentId, offset: u64, buf: &mut [u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        let extents = self.extents.read();
        let data = extents
            .get(&extent)
            .ok_or(RfixError::ExtentNotFound(extent.0))?;
        let start = usize::try_from(offset).map_err(|_| RfixError::Eof)?;
        let end = start.checked_add(buf.len()).ok_or(RfixError::Eof)?;
        let src = data.get(start..end).ok_or(RfixError::Eof)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(
        &self,
        cx: &Cx,
        extent: ExtentId,
        offset: u64,
        data: &[u8],
        crc: u32,
        mode: WriteMode,
    ) -> Result<()> {
        cx_checkpoint(cx)?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RfixError::Io(std::io::Error::other(format!(
                "injected write failure on extent {extent}"
            ))));
        }
        let computed = crc32fast::hash(data);
        if computed != crc {
            return Err(RfixError::Format(format!(
                "write CRC mismatch on extent {extent}: given {crc:#010x}, computed {computed:#010x}"
            )));
        }
        let mut extents = self.extents.write();
        let target = extents
            .get_mut(&extent)
            .ok_or(RfixError::ExtentNotFound(extent.0))?;
        let start = usize::try_from(offset)
            .map_err(|_| RfixError::ParameterMismatch(format!("offset {offset} too large")))?;
        if mode == WriteMode::Append && start != target.len() {
            return Err(RfixError::ParameterMismatch(format!(
                "append at {start} but extent {extent} ends at {}",
                target.len()
            )));
        }
        let end = start
            .checked_add(data.len())
            .ok_or_else(|| RfixError::ParameterMismatch("write range overflows".to_owned()))?;
        if target.len() < end {
            target.resize(end, 0);
        }
        target[start..end].copy_from_slice(data);
        self.writes.fetch_add(1, Ordering::SeqCst);
        trace!(extent = extent.0, offset, len = data.len(), ?mode, "mem_extent_write");
        Ok(())
    }

    fn fingerprint(
        &self,
        cx: &Cx,
        extent: ExtentId,
        offset: u64,
        size: u64,
        _force: bool,
    ) -> Result<Fingerprint> {
        cx_checkpoint(cx)?;
        let extents = self.extents.read();
        let data = extents
            .get(&extent)
            .ok_or(RfixError::ExtentNotFound(extent.0))?;
        let len = data.len() as u64;
        if offset >= len {
            return Ok(Fingerprint::default());
        }
        let end = offset.saturating_add(size).min(len);
        // Both bounds are <= data.len(), so they fit in usize.
        let slice = &data[offset as usize..end as usize];
        Ok(Fingerprint::compute(offset, slice, self.block_size))
    }

    fn fingerprint_block_size(&self) -> u64 {
        self.block_size
    }

    fn watermark(&self, extent: ExtentId) -> Result<u64> {
        self.extents
            .read()
            .get(&extent)
            .map(|data| data.len() as u64)
            .ok_or(RfixError::ExtentNotFound(extent.0))
    }

    fn tiny_extent_size(&self, extent: ExtentId) -> Result<u64> {
        if !extent.is_tiny() {
            return Err(RfixError::ParameterMismatch(format!(
                "extent {extent} is not a tiny extent"
            )));
        }
        self.watermark(extent)
    }
}
