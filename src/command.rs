//! `Command` — one request/response unit (`spec.md` §3).

use crate::{
    store::MetadataEntry,
    volume::VolumeRef,
    wire::Header,
};

/// Connection id a command arrived on, used to reject stale completions
/// when that socket has since died (`spec.md` §3 `conn`, §4.D teardown).
pub type ConnId = u64;

/// One request/response unit flowing through the dispatch pipeline.
///
/// Lifecycle (`spec.md` §3): allocated on frame receipt, owned by the
/// dispatch pipeline, then freed either immediately after execution (the
/// rebuild-write case, no ack), after a successful ack send, or during
/// socket cleanup. In Rust this is just ordinary ownership — there is no
/// explicit "free" call, dropping the value is the free.
pub struct Command {
    pub header: Header,
    /// Present iff `header.opcode` is READ, WRITE or OPEN.
    pub payload: Option<Vec<u8>>,
    /// Populated on READ when the caller requested metadata.
    pub metadata_desc: Option<Vec<MetadataEntry>>,
    pub volume: VolumeRef,
    pub conn: ConnId,
}

impl Command {
    pub fn new(header: Header, payload: Option<Vec<u8>>, volume: VolumeRef, conn: ConnId) -> Self {
        Self {
            header,
            payload,
            metadata_desc: None,
            volume,
            conn,
        }
    }
}
