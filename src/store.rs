//! The external block-store collaborator (`spec.md` §1, §6). This crate
//! never implements snapshotting, dedup or on-disk layout itself — it only
//! defines the interface a real `VolumeStore` must expose so the worker,
//! ack-sender and rebuild engine can drive it. A production daemon wires in
//! its own implementation; tests use [`crate::test_support::FakeVolumeStore`].

use snafu::Snafu;

/// Opaque handle into the external block store. The engine never
/// interprets this value; it is handed back unchanged on every call.
pub type StoreHandle = u64;

/// One block reported as modified since a given io-sequence by
/// [`VolumeStore::get_io_diff`].
#[derive(Debug, Clone, Copy)]
pub struct DiffBlock {
    pub offset: u64,
    pub len: u64,
    pub io_num: u64,
}

/// Failures surfaced by the store. The worker translates every variant
/// into a `FAILED` reply status (`spec.md` §7); nothing here is retried
/// inside the core.
#[derive(Debug, Snafu, Clone)]
#[snafu(context(suffix(false)))]
pub enum StoreError {
    #[snafu(display("read failed at offset {offset}, len {len}: {reason}"))]
    ReadFailed { offset: u64, len: u64, reason: String },
    #[snafu(display("write failed at offset {offset}, len {len}: {reason}"))]
    WriteFailed { offset: u64, len: u64, reason: String },
    #[snafu(display("flush failed: {reason}"))]
    FlushFailed { reason: String },
    #[snafu(display("failed to persist checkpointed io number {io_num}: {reason}"))]
    CheckpointFailed { io_num: u64, reason: String },
}

/// One `{offset,len,io_num}` triple describing which write last touched a
/// byte range, returned by [`VolumeStore::read`] when metadata was
/// requested and serialised onto the wire after a READ reply's data
/// (`spec.md` §6, "READ reply format").
#[derive(Debug, Clone, Copy)]
pub struct MetadataEntry {
    pub offset: u64,
    pub len: u64,
    pub io_num: u64,
}

/// The on-disk block-store engine, out of scope per `spec.md` §1. Every
/// method is synchronous and blocking, matching the worker's blocking
/// dispatch model (`spec.md` §5, "blocking-socket model").
pub trait VolumeStore: Send + Sync {
    /// Reads `len` bytes at `offset` into `buf`. When `want_metadata` is
    /// `true` the store additionally reports the io-num that last wrote
    /// each byte range touched by this read, coalesced into
    /// `{offset,len,io_num}` triples.
    fn read(
        &self,
        handle: StoreHandle,
        buf: &mut [u8],
        offset: u64,
        len: u64,
        want_metadata: bool,
    ) -> Result<Vec<MetadataEntry>, StoreError>;

    /// Applies one write record. `is_rebuild` marks writes arriving via
    /// the rebuild path (`spec.md` §4.C, §4.E) so the store can, if it
    /// chooses, treat them differently from live client writes (e.g.
    /// skip its own diff bookkeeping for data it is the source of).
    fn write(
        &self,
        handle: StoreHandle,
        data: &[u8],
        offset: u64,
        len: u64,
        io_num: u64,
        is_rebuild: bool,
    ) -> Result<(), StoreError>;

    /// Durably flushes all writes applied so far.
    fn flush(&self, handle: StoreHandle) -> Result<(), StoreError>;

    /// Enumerates every block modified since io-sequence `since` within
    /// `[offset, offset+len)`, invoking `cb` once per block in ascending
    /// offset order (`spec.md` §4.E, donor "Serving" state).
    fn get_io_diff(
        &self,
        handle: StoreHandle,
        since: u64,
        offset: u64,
        len: u64,
        cb: &mut dyn FnMut(DiffBlock),
    ) -> Result<(), StoreError>;

    /// Durably records `io_num` as the last-committed I/O number for this
    /// volume (`spec.md` §4.F, checkpoint timer).
    fn store_last_committed_io(
        &self,
        handle: StoreHandle,
        io_num: u64,
    ) -> Result<(), StoreError>;

    /// Total addressable size of the volume in bytes, used by the
    /// rebuild recipient to know when it has stepped past the end
    /// (`spec.md` §4.E).
    fn volume_size(&self, handle: StoreHandle) -> u64;
}
