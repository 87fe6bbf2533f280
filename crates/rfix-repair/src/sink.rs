//! Destinations for fetched replica bytes.
//!
//! [`ExtentSink`] writes straight into the local extent. [`StagingFile`]
//! buffers one peer's copy on disk so several copies can be compared before
//! any of them touches the extent.

use asupersync::Cx;
use rfix_error::Result;
use rfix_extent::{ExtentStore, WriteMode};
use rfix_types::ExtentId;
use std::os::unix::fs::FileExt;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::limiter::{IoLimiter, RepairOp};
use crate::transport::RangeSink;

/// Writes fetched bytes into a local extent at `base + offset`.
pub struct ExtentSink<'a> {
    store: &'a dyn ExtentStore,
    limiter: &'a dyn IoLimiter,
    disk_path: &'a str,
    extent: ExtentId,
    base: u64,
    written: u64,
}

impl<'a> ExtentSink<'a> {
    pub fn new(
        store: &'a dyn ExtentStore,
        limiter: &'a dyn IoLimiter,
        disk_path: &'a str,
        extent: ExtentId,
        base: u64,
    ) -> Self {
        Self {
            store,
            limiter,
            disk_path,
            extent,
            base,
            written: 0,
        }
    }

    /// Bytes written to the extent so far.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }
}

impl RangeSink for ExtentSink<'_> {
    fn write_at(&mut self, cx: &Cx, offset: u64, data: &[u8]) -> Result<()> {
        let len = data.len() as u64;
        self.limiter
            .wait_flow(RepairOp::RepairWrite, len, self.disk_path)?;
        let crc = crc32fast::hash(data);
        let extent_offset = self.base.saturating_add(offset);
        self.store
            .write(cx, self.extent, extent_offset, data, crc, WriteMode::Random)?;
        self.written = self.written.saturating_add(len);
        debug!(
            target: "rfix::repair",
            extent = self.extent.0,
            offset = extent_offset,
            size = len,
            "extent_repair_write"
        );
        Ok(())
    }
}

/// One peer's copy of a range, staged in a temporary file.
///
/// Lives at `<staging_dir>/{extent}_{offset}_{size}_{host}*` and is removed
/// when dropped. Keeps a running CRC-32/IEEE of every byte written and the
/// ranges that actually received data, so holes can be told apart from
/// zeros.
#[derive(Debug)]
pub struct StagingFile {
    file: NamedTempFile,
    hasher: crc32fast::Hasher,
    ranges: Vec<(u64, u64)>,
}

impl StagingFile {
    pub fn create(
        staging_dir: &Path,
        host: &str,
        extent: ExtentId,
        offset: u64,
        size: u64,
    ) -> Result<Self> {
        std::fs::create_dir_all(staging_dir)?;
        let host: String = host
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        let file = tempfile::Builder::new()
            .prefix(&format!("{extent}_{offset}_{size}_{host}"))
            .tempfile_in(staging_dir)?;
        Ok(Self {
            file,
            hasher: crc32fast::Hasher::new(),
            ranges: Vec::new(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// CRC-32/IEEE of the bytes received, in arrival order. Zero when nothing
    /// was received.
    #[must_use]
    pub fn crc(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    /// Half-open ranges that received data, sorted and merged.
    #[must_use]
    pub fn data_ranges(&self) -> &[(u64, u64)] {
        &self.ranges
    }

    /// End of the last byte received.
    #[must_use]
    pub fn data_end(&self) -> u64 {
        self.ranges.last().map_or(0, |&(_, end)| end)
    }

    fn record_range(&mut self, start: u64, end: u64) {
        self.ranges.push((start, end));
        self.ranges.sort_unstable();
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.ranges.len());
        for &(s, e) in &self.ranges {
            match merged.last_mut() {
                Some(last) if s <= last.1 => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }
        self.ranges = merged;
    }

    /// Copy the staged bytes of `[0, size)` into `sink` in `block_size`
    /// chunks.
    ///
    /// With `skip_holes` only ranges that received data are copied and holes
    /// leave the destination untouched. Otherwise everything up to the last
    /// received byte is copied, unreceived gaps as zeros.
    pub fn apply_to(
        &self,
        cx: &Cx,
        sink: &mut dyn RangeSink,
        size: u64,
        block_size: u64,
        skip_holes: bool,
    ) -> Result<()> {
        let spans: Vec<(u64, u64)> = if skip_holes {
            self.ranges
                .iter()
                .filter(|&&(start, _)| start < size)
                .map(|&(start, end)| (start, end.min(size)))
                .collect()
        } else {
            // Stop at the last received byte: a short reply must not zero the
            // local tail it never covered.
            vec![(0, self.data_end().min(size))]
        };

        let chunk = usize::try_from(block_size.max(1)).unwrap_or(usize::MAX);
        let mut buf = Vec::new();
        for (start, end) in spans {
            let mut pos = start;
            while pos < end {
                let len = usize::try_from(end - pos).unwrap_or(usize::MAX).min(chunk);
                buf.resize(len, 0);
                self.file.as_file().read_exact_at(&mut buf, pos)?;
                sink.write_at(cx, pos, &buf)?;
                pos += len as u64;
            }
        }
        Ok(())
    }
}

impl RangeSink for StagingFile {
    fn write_at(&mut self, _cx: &Cx, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.file.as_file().write_all_at(data, offset)?;
        self.hasher.update(data);
        self.record_range(offset, offset.saturating_add(data.len() as u64));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::Unlimited;
    use rfix_extent::MemExtentStore;

    #[derive(Default)]
    struct Collect {
        writes: Vec<(u64, Vec<u8>)>,
    }

    impl RangeSink for Collect {
        fn write_at(&mut self, _cx: &Cx, offset: u64, data: &[u8]) -> Result<()> {
            self.writes.push((offset, data.to_vec()));
            Ok(())
        }
    }

    #[test]
    fn extent_sink_writes_at_base_offset() {
        let cx = Cx::for_testing();
        let store = MemExtentStore::new(4);
        store.put(ExtentId(1025), vec![0_u8; 16]);
        let mut sink = ExtentSink::new(&store, &Unlimited, "/d", ExtentId(1025), 8);
        sink.write_at(&cx, 2, b"abc").expect("write");
        assert_eq!(sink.written(), 3);
        let contents = store.contents(ExtentId(1025)).expect("extent");
        assert_eq!(&contents[10..13], b"abc");
    }

    #[test]
    fn staging_file_tracks_crc_and_ranges() {
        let cx = Cx::for_testing();
        let dir = tempfile::tempdir().expect("tempdir");
        let staging = dir.path().join(".temp");
        let path;
        {
            let mut file =
                StagingFile::create(&staging, "10.0.0.1:17310", ExtentId(3), 0, 16).expect("create");
            path = file.path().to_path_buf();
            assert!(path.file_name().expect("name").to_string_lossy().starts_with("3_0_16_10.0.0.1:17310"));
            assert_eq!(file.crc(), 0);

            file.write_at(&cx, 0, b"ab").expect("write");
            file.write_at(&cx, 8, b"xy").expect("write");
            file.write_at(&cx, 2, b"cd").expect("write");
            assert_eq!(file.data_ranges(), &[(0, 4), (8, 10)]);
            assert_eq!(file.data_end(), 10);

            let mut hasher = crc32fast::Hasher::new();
            hasher.update(b"ab");
            hasher.update(b"xy");
            hasher.update(b"cd");
            assert_eq!(file.crc(), hasher.finalize());
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn apply_skips_holes_only_when_asked() {
        let cx = Cx::for_testing();
        let dir = tempfile::tempdir().expect("tempdir");
        let mut file = StagingFile::create(dir.path(), "h", ExtentId(3), 0, 16).expect("create");
        file.write_at(&cx, 0, b"abcd").expect("write");
        file.write_at(&cx, 8, b"wxyz").expect("write");

        let mut holes = Collect::default();
        file.apply_to(&cx, &mut holes, 16, 3, true).expect("apply");
        assert_eq!(
            holes.writes,
            vec![
                (0, b"abc".to_vec()),
                (3, b"d".to_vec()),
                (8, b"wxy".to_vec()),
                (11, b"z".to_vec()),
            ]
        );

        let mut dense = Collect::default();
        file.apply_to(&cx, &mut dense, 10, 8, false).expect("apply");
        assert_eq!(
            dense.writes,
            vec![(0, b"abcd\0\0\0\0".to_vec()), (8, b"wx".to_vec())]
        );
    }

    #[test]
    fn short_staged_copy_leaves_uncovered_tail_alone() {
        let cx = Cx::for_testing();
        let dir = tempfile::tempdir().expect("tempdir");
        let mut file = StagingFile::create(dir.path(), "h", ExtentId(1025), 0, 16).expect("create");
        file.write_at(&cx, 0, b"abcdef").expect("write");

        let mut dense = Collect::default();
        file.apply_to(&cx, &mut dense, 16, 4, false).expect("apply");
        assert_eq!(dense.writes, vec![(0, b"abcd".to_vec()), (4, b"ef".to_vec())]);
    }
}
