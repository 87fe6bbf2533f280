//! Durable ledger of unresolved fragments.
//!
//! The ledger file is an arena of fixed 28-byte slots. Registering a fragment
//! appends a record at the tracked end offset; resolving it overwrites that
//! slot with [`TOMBSTONE_RECORD`]. Slots never move, so the offset returned
//! by [`FragmentLedger::append`] addresses the record for the fragment's whole
//! lifetime. Space is reclaimed only by [`FragmentLedger::compact`], which the
//! owner calls once nothing is outstanding.
//!
//! # Invariants
//!
//! - File length is a multiple of 28 after every successful operation; a
//!   trailing partial record (torn append) is truncated on load.
//! - Tombstones are skipped on load; any other undecodable slot fails the load.
//! - All file I/O is serialized through one lock, held only for the I/O itself.

use parking_lot::Mutex;
use rfix_error::{Result, RfixError};
use rfix_types::{FRAGMENT_RECORD_LEN, Fragment, TOMBSTONE_RECORD};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

const RECORD_LEN: u64 = FRAGMENT_RECORD_LEN as u64;

/// A live fragment and the ledger offset of its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentIndexEntry {
    pub fragment: Fragment,
    pub log_offset: u64,
}

/// Counters for ledger operations since open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerStats {
    pub appends: u64,
    pub erases: u64,
    pub compactions: u64,
}

#[derive(Debug)]
struct LedgerIo {
    file: Option<File>,
    next_offset: u64,
}

impl LedgerIo {
    /// Open the ledger file if it is not open yet.
    ///
    /// Returns `None` when the file does not exist and `create` is false.
    fn ensure_open(&mut self, path: &Path, create: bool) -> Result<Option<&mut File>> {
        if self.file.is_none() {
            let opened = OpenOptions::new()
                .read(true)
                .write(true)
                .create(create)
                .truncate(false)
                .open(path);
            let file = match opened {
                Ok(file) => file,
                Err(e) if !create && e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let len = file.metadata()?.len();
            self.next_offset = len - len % RECORD_LEN;
            self.file = Some(file);
        }
        Ok(self.file.as_mut())
    }
}

/// Switches that make the next ledger mutations fail.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct Faults {
    pub(crate) append: std::sync::atomic::AtomicBool,
    pub(crate) erase: std::sync::atomic::AtomicBool,
    pub(crate) compact: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl Faults {
    fn check(flag: &std::sync::atomic::AtomicBool, op: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(io::Error::other(format!("injected {op} failure")).into());
        }
        Ok(())
    }
}

/// Fixed-record fragment ledger for one partition.
#[derive(Debug)]
pub struct FragmentLedger {
    path: PathBuf,
    sync_on_append: bool,
    io: Mutex<LedgerIo>,
    appends: AtomicU64,
    erases: AtomicU64,
    compactions: AtomicU64,
    #[cfg(test)]
    pub(crate) faults: Faults,
}

impl FragmentLedger {
    /// Bind a ledger to `path`. Nothing is created until the first append.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, sync_on_append: bool) -> Self {
        Self {
            path: path.into(),
            sync_on_append,
            io: Mutex::new(LedgerIo {
                file: None,
                next_offset: 0,
            }),
            appends: AtomicU64::new(0),
            erases: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
            #[cfg(test)]
            faults: Faults::default(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset the next appended record will be written at.
    #[must_use]
    pub fn next_offset(&self) -> u64 {
        self.io.lock().next_offset
    }

    #[must_use]
    pub fn stats(&self) -> LedgerStats {
        LedgerStats {
            appends: self.appends.load(Ordering::Relaxed),
            erases: self.erases.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
        }
    }

    /// Read every live record.
    ///
    /// A missing file means no fragments. A trailing partial record is
    /// truncated away before parsing.
    ///
    /// # Errors
    ///
    /// Fails with [`RfixError::CorruptRecord`] if any non-tombstone slot does
    /// not decode; the ledger must not be partially trusted.
    pub fn load(&self) -> Result<Vec<FragmentIndexEntry>> {
        let mut io = self.io.lock();
        let Some(file) = io.ensure_open(&self.path, false)? else {
            debug!(target: "rfix::ledger", path = %self.path.display(), "ledger_absent");
            return Ok(Vec::new());
        };

        let file_len = file.metadata()?.len();
        let valid_len = file_len - file_len % RECORD_LEN;
        if valid_len != file_len {
            warn!(
                target: "rfix::ledger",
                path = %self.path.display(),
                file_len,
                valid_len,
                "ledger_partial_record_truncated"
            );
            file.set_len(valid_len)?;
        }

        file.seek(SeekFrom::Start(0))?;
        let record_count = valid_len / RECORD_LEN;
        let mut reader = BufReader::new(&*file);
        let mut record = [0_u8; FRAGMENT_RECORD_LEN];
        let mut entries = Vec::new();
        for index in 0..record_count {
            let offset = index * RECORD_LEN;
            reader.read_exact(&mut record).map_err(|e| {
                RfixError::BrokenLedger(format!("short read at offset {offset}: {e}"))
            })?;
            if record == TOMBSTONE_RECORD {
                continue;
            }
            let fragment = Fragment::decode(&record).map_err(|e| {
                let detail = match e {
                    RfixError::CorruptRecord { detail, .. } => detail,
                    other => other.to_string(),
                };
                error!(
                    target: "rfix::ledger",
                    path = %self.path.display(),
                    offset,
                    detail = %detail,
                    "ledger_record_corrupt"
                );
                RfixError::CorruptRecord { offset, detail }
            })?;
            if fragment.is_empty() {
                continue;
            }
            entries.push(FragmentIndexEntry {
                fragment,
                log_offset: offset,
            });
        }
        io.next_offset = valid_len;

        info!(
            target: "rfix::ledger",
            path = %self.path.display(),
            records = record_count,
            live = entries.len(),
            "ledger_loaded"
        );
        Ok(entries)
    }

    /// Append `fragment` and return the offset of its record.
    pub fn append(&self, fragment: &Fragment) -> Result<u64> {
        let record = fragment.encode();
        let mut io = self.io.lock();
        #[cfg(test)]
        Faults::check(&self.faults.append, "append")?;
        let offset = io.next_offset;
        let file = io
            .ensure_open(&self.path, true)?
            .ok_or_else(|| RfixError::BrokenLedger("ledger could not be created".to_owned()))?;
        file.write_all_at(&record, offset)?;
        if self.sync_on_append {
            file.sync_data()?;
        }
        io.next_offset = offset + RECORD_LEN;
        self.appends.fetch_add(1, Ordering::Relaxed);
        debug!(target: "rfix::ledger", %fragment, offset, "ledger_appended");
        Ok(offset)
    }

    /// Overwrite the record at `offset` with a tombstone.
    ///
    /// Idempotent; erasing in a ledger whose file is gone is a no-op.
    pub fn erase(&self, offset: u64) -> Result<()> {
        if offset % RECORD_LEN != 0 {
            return Err(RfixError::Format(format!(
                "ledger offset {offset} is not record aligned"
            )));
        }
        let mut io = self.io.lock();
        #[cfg(test)]
        Faults::check(&self.faults.erase, "erase")?;
        let Some(file) = io.ensure_open(&self.path, false)? else {
            return Ok(());
        };
        file.write_all_at(&TOMBSTONE_RECORD, offset)?;
        self.erases.fetch_add(1, Ordering::Relaxed);
        debug!(target: "rfix::ledger", offset, "ledger_erased");
        Ok(())
    }

    /// Truncate the ledger to zero length and close it.
    ///
    /// Only valid when no fragment is live; the caller enforces that.
    pub fn compact(&self) -> Result<()> {
        let mut io = self.io.lock();
        #[cfg(test)]
        Faults::check(&self.faults.compact, "compact")?;
        if let Some(file) = io.ensure_open(&self.path, false)? {
            file.set_len(0)?;
        }
        io.file = None;
        io.next_offset = 0;
        self.compactions.fetch_add(1, Ordering::Relaxed);
        info!(target: "rfix::ledger", path = %self.path.display(), "ledger_compacted");
        Ok(())
    }
}
