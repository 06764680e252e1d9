//! Donor half of the rebuild engine, the inbound "scanner"
//! (`spec.md` §4.E "Donor").

use std::{net::TcpStream, sync::Arc, time::Duration};

use tracing::{info, info_span, warn};

use crate::{
    command::{Command, ConnId},
    connection,
    store::{DiffBlock, VolumeStore},
    volume::{VolumeInfo, VolumeRef, VolumeRegistry},
    wire::{self, Flags, Header, Opcode},
    worker,
};

/// Serves one accepted rebuild-port connection to completion: a
/// pre-handshake state that only accepts HANDSHAKE, then a Serving loop
/// that answers REBUILD_STEP with the store's diff enumeration and
/// closes on REBUILD_COMPLETE.
pub fn serve_rebuild_connection(
    stream: TcpStream,
    conn: ConnId,
    registry: Arc<VolumeRegistry>,
    store: Arc<dyn VolumeStore>,
) {
    let span = info_span!("rebuild-donor", conn);
    let _enter = span.enter();

    let stream = match apply_reset_linger(stream) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to set SO_LINGER on donor connection");
            return;
        },
    };
    let mut stream = stream;

    let volume = match connection::handshake(&mut stream, &registry) {
        Some(v) => v,
        None => return,
    };

    let ack_handle = match connection::bind_and_spawn_ack_sender(&stream, conn, &volume) {
        Some(h) => h,
        None => return,
    };

    serving_loop(&mut stream, conn, &volume, store.as_ref());

    connection::teardown(&volume, conn);
    let _ = ack_handle.join();
}

fn serving_loop(stream: &mut TcpStream, conn: ConnId, volume: &Arc<VolumeInfo>, store: &dyn VolumeStore) {
    loop {
        let header = match wire::read_header(stream) {
            Ok(h) => h,
            Err(e) => {
                info!(error = %e, "rebuild connection closing");
                return;
            },
        };

        match header.opcode {
            Opcode::RebuildStep => {
                if let Err(e) = serve_rebuild_step(&header, conn, volume, store) {
                    warn!(error = %e, "failed enumerating rebuild diff");
                    return;
                }
            },
            Opcode::RebuildComplete => {
                info!(volume = %volume.name, "recipient reports rebuild complete");
                return;
            },
            Opcode::Handshake => {
                // Re-entrant HANDSHAKE: the spec's source logs and
                // continues, this crate closes instead
                // (`SPEC_FULL.md` §B open-question resolution).
                warn!("re-entrant HANDSHAKE on an already-bound rebuild connection, closing");
                return;
            },
            other => {
                warn!(opcode = ?other, "unexpected opcode in donor Serving state, closing");
                return;
            },
        }
    }
}

/// `REBUILD_STEP` (`spec.md` §4.E "Serving"): enumerates every modified
/// block via `get_io_diff`, submitting one fabricated READ-reply
/// [`Command`] per block in enumeration order, then a trailing
/// `REBUILD_STEP_DONE`. Runs synchronously on the scanner's own thread
/// (rather than via the shared worker pool) so the enqueue order into
/// `complete_queue` is exactly the enumeration order the spec requires
/// ("the donor must send all READ replies for that step before sending
/// the STEP_DONE reply").
fn serve_rebuild_step(
    header: &Header,
    conn: ConnId,
    volume: &Arc<VolumeInfo>,
    store: &dyn VolumeStore,
) -> Result<(), crate::store::StoreError> {
    let since = header.checkpointed_io_seq;
    let offset = header.offset;
    let len = header.len;

    let mut emit_block = |block: DiffBlock| {
        let mut h = Header::request(Opcode::Read);
        h.flags = Flags::REBUILD;
        h.offset = block.offset;
        h.len = block.len;
        h.io_seq = block.io_num;
        let cmd = Command::new(h, None, VolumeRef::acquire(volume), conn);
        worker::dispatch(cmd, store);
    };
    store.get_io_diff(volume.store_handle, since, offset, len, &mut emit_block)?;

    let done_header = Header::request(Opcode::RebuildStepDone);
    let done_cmd = Command::new(done_header, None, VolumeRef::acquire(volume), conn);
    worker::dispatch(done_cmd, store);
    Ok(())
}

fn apply_reset_linger(stream: TcpStream) -> std::io::Result<TcpStream> {
    let socket = socket2::Socket::from(stream);
    socket.set_linger(Some(Duration::from_secs(0)))?;
    Ok(socket.into())
}
