//! Recipient half of the rebuild engine (`spec.md` §4.E "Recipient").
//! One dedicated task per donor, driving the step loop and applying the
//! READ frames it receives as local writes.

use std::{
    net::{SocketAddr, TcpStream},
    sync::Arc,
    time::Duration,
};

use tracing::{info, info_span, warn};

use super::RebuildError;
use crate::{
    checkpoint::CheckpointService,
    command::Command,
    store::VolumeStore,
    volume::{RebuildStatus, VolumeInfo, VolumeRef},
    wire::{self, Header, Opcode, Status},
    worker,
};

/// Writes applied through the synchronous rebuild path never carry a
/// real peer connection; this sentinel is never matched against a live
/// data-connection's id (`spec.md` §3 `conn` is only meaningful for
/// ack-routing, which rebuild writes never do — see `worker::dispatch`
/// ack policy).
const REBUILD_CONN: u64 = u64::MAX;

/// Runs one recipient task end-to-end against a single donor, then
/// performs the terminal bookkeeping in `spec.md` §4.E steps 4-5
/// regardless of how the step loop ended.
pub fn run_recipient(
    volume: Arc<VolumeInfo>,
    donor_addr: SocketAddr,
    store: Arc<dyn VolumeStore>,
    checkpoint: Arc<CheckpointService>,
    step_size: u64,
) {
    let span = info_span!("rebuild-recipient", volume = %volume.name, donor = %donor_addr);
    let _enter = span.enter();

    // Held for the task's full connect->step-loop->complete duration
    // (`spec.md` §5: "one long-lived refcount per rebuild-recipient
    // task"), mirroring the ack-sender's long-lived ref in
    // `connection.rs`.
    let _task_ref = VolumeRef::acquire(&volume);

    if let Err(e) = recipient_inner(&volume, donor_addr, store.as_ref(), step_size) {
        warn!(error = %e, "rebuild aborted");
        volume.mark_rebuild_errored();
    }

    let terminal = volume.finish_rebuild_task();
    if terminal {
        // "wake the checkpoint timer (interval 0 means no change, just
        // wake)" (`spec.md` §4.E step 5).
        checkpoint.update_ionum_interval(&volume, 0);
        info!(status = ?volume.rebuild_status(), "rebuild reached a terminal state");
    }
}

fn recipient_inner(
    volume: &Arc<VolumeInfo>,
    donor_addr: SocketAddr,
    store: &dyn VolumeStore,
    step_size: u64,
) -> Result<(), RebuildError> {
    let snapshot = volume.checkpointed_ionum();
    let mut stream = connect_with_reset_linger(donor_addr)?;
    send_handshake(&mut stream, &volume.name)?;

    let volume_size = store.volume_size(volume.store_handle);
    let mut offset = 0u64;

    loop {
        if volume.rebuild_status() == RebuildStatus::Errored {
            return Err(RebuildError::Aborted);
        }
        if offset >= volume_size {
            send_rebuild_complete(&mut stream)?;
            return Ok(());
        }

        let len = step_size.min(volume_size - offset);
        send_rebuild_step(&mut stream, offset, len, snapshot)?;

        loop {
            let header = wire::read_header(&mut stream)?;
            if header.status == Status::Failed {
                return Err(RebuildError::DonorFailed { offset });
            }
            match header.opcode {
                Opcode::RebuildStepDone => {
                    drain_if_any(&mut stream, header.meta_len)?;
                    offset += len;
                    break;
                },
                Opcode::Read if header.is_rebuild() => {
                    apply_rebuild_read(&mut stream, &header, volume, store)?;
                },
                other => return Err(RebuildError::UnexpectedFrame { opcode: other }),
            }
        }
    }
}

/// Reads a donor READ frame's payload and applies it as a local write
/// (`spec.md` §4.E step 3: "rewrite opcode to WRITE, ... invoke the
/// local worker synchronously on this task"). No ack is produced for
/// this write per `spec.md` §4.C step 5 — the recipient never has an
/// ack-sender bound on this connection in the first place.
fn apply_rebuild_read(
    stream: &mut TcpStream,
    header: &Header,
    volume: &Arc<VolumeInfo>,
    store: &dyn VolumeStore,
) -> Result<(), RebuildError> {
    let mut data = vec![0u8; header.len as usize];
    wire::read_exact(stream, &mut data)?;
    drain_if_any(stream, header.meta_len)?;

    let mut write_header = *header;
    write_header.opcode = Opcode::Write;

    let mut payload = Vec::with_capacity(16 + data.len());
    payload.extend_from_slice(&header.io_seq.to_le_bytes());
    payload.extend_from_slice(&header.len.to_le_bytes());
    payload.extend_from_slice(&data);
    write_header.len = payload.len() as u64;

    let cmd = Command::new(
        write_header,
        Some(payload),
        VolumeRef::acquire(volume),
        REBUILD_CONN,
    );
    match worker::dispatch(cmd, store) {
        Status::Ok => Ok(()),
        Status::Failed => Err(RebuildError::ApplyWriteFailed {
            offset: header.offset,
        }),
    }
}

fn drain_if_any(stream: &mut TcpStream, meta_len: u32) -> Result<(), RebuildError> {
    if meta_len == 0 {
        return Ok(());
    }
    let mut discard = vec![0u8; meta_len as usize];
    wire::read_exact(stream, &mut discard)?;
    Ok(())
}

fn send_handshake(stream: &mut TcpStream, volume_name: &str) -> Result<(), RebuildError> {
    let mut header = Header::request(Opcode::Handshake);
    header.len = volume_name.len() as u64;
    wire::write_header(stream, &header)?;
    wire::write_exact(stream, volume_name.as_bytes())?;
    Ok(())
}

fn send_rebuild_step(
    stream: &mut TcpStream,
    offset: u64,
    len: u64,
    checkpointed_io_seq: u64,
) -> Result<(), RebuildError> {
    let mut header = Header::request(Opcode::RebuildStep);
    header.offset = offset;
    header.len = len;
    header.checkpointed_io_seq = checkpointed_io_seq;
    wire::write_header(stream, &header)?;
    Ok(())
}

fn send_rebuild_complete(stream: &mut TcpStream) -> Result<(), RebuildError> {
    let header = Header::request(Opcode::RebuildComplete);
    wire::write_header(stream, &header)?;
    Ok(())
}

/// Connects to the donor with `SO_LINGER{on=1,timeout=0}` so a later
/// close is a reset rather than a graceful drain (`spec.md` §4.E,
/// avoiding `TIME_WAIT` on short-lived rebuild connections).
fn connect_with_reset_linger(addr: SocketAddr) -> Result<TcpStream, RebuildError> {
    let domain = socket2::Domain::for_address(addr);
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))
        .map_err(|source| RebuildError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    socket
        .set_linger(Some(Duration::from_secs(0)))
        .map_err(|source| RebuildError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    socket
        .connect(&addr.into())
        .map_err(|source| RebuildError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    Ok(socket.into())
}
