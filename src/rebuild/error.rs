//! Rebuild abort causes (`spec.md` §4.E step 4, §7 "Rebuild-abort").
//! Grounded on the teacher crate's `rebuild/rebuild_error.rs`: one
//! `Snafu` enum per failure cause, `context(suffix(false))` so call
//! sites attach context without an extra `Error` suffix on the context
//! selector.

use snafu::Snafu;

use crate::wire::WireError;

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum RebuildError {
    #[snafu(display("failed to connect to donor at {addr}"))]
    Connect { addr: String, source: std::io::Error },
    #[snafu(display("wire error talking to donor: {source}"))]
    Wire { source: WireError },
    #[snafu(display("donor replied with status FAILED for step at offset {offset}"))]
    DonorFailed { offset: u64 },
    #[snafu(display("expected a REBUILD-flagged READ frame, got {opcode:?}"))]
    UnexpectedFrame { opcode: crate::wire::Opcode },
    #[snafu(display("applying rebuild write at offset {offset} failed"))]
    ApplyWriteFailed { offset: u64 },
    #[snafu(display("rebuild aborted: volume status moved to ERRORED"))]
    Aborted,
}

impl From<WireError> for RebuildError {
    fn from(source: WireError) -> Self {
        RebuildError::Wire { source }
    }
}
