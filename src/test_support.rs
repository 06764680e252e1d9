//! In-memory fakes for exercising the wire codec, worker dispatch and
//! rebuild state machine without a real block-store backend, mirroring
//! how `io-engine-tests` provides fakes for the teacher crate's own
//! integration tests (`SPEC_FULL.md` §A.4).
//!
//! Gated behind `cfg(test)` or the `test-support` feature so it never
//! ships in a release build of the library, while still being usable
//! from other crates' integration tests when the feature is enabled.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use crate::store::{DiffBlock, MetadataEntry, StoreError, StoreHandle, VolumeStore};

/// One in-memory volume: a byte vector plus a sparse map from byte
/// offset to the io-num that last wrote it, so `get_io_diff` and
/// metadata reads have something real to report.
struct Inner {
    data: Vec<u8>,
    /// offset -> io_num of the most recent write starting at that offset.
    write_log: BTreeMap<u64, u64>,
    last_committed_io: u64,
}

/// A single-volume, in-memory [`VolumeStore`]. `StoreHandle` is always
/// `0` — tests that need multiple volumes construct one
/// `FakeVolumeStore` per volume.
pub struct FakeVolumeStore {
    inner: Mutex<Inner>,
    size: u64,
    flush_count: AtomicU64,
}

impl FakeVolumeStore {
    pub fn new(size: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                data: vec![0u8; size as usize],
                write_log: BTreeMap::new(),
                last_committed_io: 0,
            }),
            size,
            flush_count: AtomicU64::new(0),
        }
    }

    pub fn handle(&self) -> StoreHandle {
        0
    }

    pub fn flush_count(&self) -> u64 {
        self.flush_count.load(Ordering::Relaxed)
    }

    pub fn last_committed_io(&self) -> u64 {
        self.inner.lock().unwrap().last_committed_io
    }
}

impl VolumeStore for FakeVolumeStore {
    fn read(
        &self,
        _handle: StoreHandle,
        buf: &mut [u8],
        offset: u64,
        len: u64,
        want_metadata: bool,
    ) -> Result<Vec<MetadataEntry>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let start = offset as usize;
        let end = start + len as usize;
        if end > inner.data.len() {
            return Err(StoreError::ReadFailed {
                offset,
                len,
                reason: "out of bounds".into(),
            });
        }
        buf[.. len as usize].copy_from_slice(&inner.data[start .. end]);

        if !want_metadata {
            return Ok(Vec::new());
        }
        // Coalesce the write log into contiguous runs sharing the same
        // io_num, restricted to [offset, offset+len).
        let mut entries = Vec::new();
        let mut cursor = offset;
        while cursor < offset + len {
            let io_num = inner
                .write_log
                .range(..= cursor)
                .next_back()
                .map(|(_, io)| *io)
                .unwrap_or(0);
            let next_boundary = inner
                .write_log
                .range((cursor + 1) ..)
                .next()
                .map(|(off, _)| *off)
                .unwrap_or(offset + len);
            let run_end = next_boundary.min(offset + len);
            entries.push(MetadataEntry {
                offset: cursor,
                len: run_end - cursor,
                io_num,
            });
            cursor = run_end;
        }
        Ok(entries)
    }

    fn write(
        &self,
        _handle: StoreHandle,
        data: &[u8],
        offset: u64,
        len: u64,
        io_num: u64,
        _is_rebuild: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let start = offset as usize;
        let end = start + len as usize;
        if end > inner.data.len() {
            return Err(StoreError::WriteFailed {
                offset,
                len,
                reason: "out of bounds".into(),
            });
        }
        inner.data[start .. end].copy_from_slice(&data[.. len as usize]);
        inner.write_log.insert(offset, io_num);
        Ok(())
    }

    fn flush(&self, _handle: StoreHandle) -> Result<(), StoreError> {
        self.flush_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn get_io_diff(
        &self,
        _handle: StoreHandle,
        since: u64,
        offset: u64,
        len: u64,
        cb: &mut dyn FnMut(DiffBlock),
    ) -> Result<(), StoreError> {
        let inner = self.inner.lock().unwrap();
        for (&block_offset, &io_num) in inner.write_log.range(offset .. offset + len) {
            if io_num > since {
                cb(DiffBlock {
                    offset: block_offset,
                    len: 1,
                    io_num,
                });
            }
        }
        Ok(())
    }

    fn store_last_committed_io(&self, _handle: StoreHandle, io_num: u64) -> Result<(), StoreError> {
        self.inner.lock().unwrap().last_committed_io = io_num;
        Ok(())
    }

    fn volume_size(&self, _handle: StoreHandle) -> u64 {
        self.size
    }
}
