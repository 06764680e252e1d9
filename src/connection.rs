//! The I/O receiver / ack-sender pair, one per accepted data-connection
//! (`spec.md` §4.D).

use std::{
    net::TcpStream,
    sync::{atomic::AtomicU64, Arc},
    time::Duration,
};

use tracing::{error, info, info_span, warn};

use crate::{
    command::{Command, ConnId},
    volume::{VolumeInfo, VolumeRef, VolumeRegistry},
    wire::{self, Opcode, Status},
    worker_pool::WorkerPool,
};

/// Generates process-unique connection ids (`spec.md` §3 `conn`).
#[derive(Default)]
pub struct ConnIdAllocator(AtomicU64);

impl ConnIdAllocator {
    pub fn next(&self) -> ConnId {
        self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }
}

/// Opcodes whose request frame carries a payload of `header.len` bytes
/// straight after the header (`spec.md` §3: "present iff opcode ∈
/// {READ, WRITE, OPEN}" — READ's payload is produced by the worker on
/// the *reply* side, not read off the wire on the request side).
fn request_carries_payload(opcode: Opcode) -> bool {
    matches!(opcode, Opcode::Write | Opcode::Open)
}

/// Runs the receiver half of a data-connection to completion: performs
/// the HANDSHAKE, starts the bound ack-sender, then reads and dispatches
/// commands until the socket dies or a framing error occurs.
pub fn serve_data_connection(
    mut stream: TcpStream,
    conn: ConnId,
    registry: Arc<VolumeRegistry>,
    pool: Arc<WorkerPool>,
) {
    let span = info_span!("receiver", conn);
    let _enter = span.enter();

    let volume = match handshake(&mut stream, &registry) {
        Some(v) => v,
        None => return,
    };

    let ack_handle = match bind_and_spawn_ack_sender(&stream, conn, &volume) {
        Some(h) => h,
        None => return,
    };

    loop {
        let header = match wire::read_header(&mut stream) {
            Ok(h) => h,
            Err(e) => {
                info!(error = %e, "data connection closing");
                break;
            },
        };

        let payload = if request_carries_payload(header.opcode) {
            let mut buf = vec![0u8; header.len as usize];
            if let Err(e) = wire::read_exact(&mut stream, &mut buf) {
                info!(error = %e, "failed reading request payload, closing");
                break;
            }
            Some(buf)
        } else {
            None
        };

        let cmd = Command::new(header, payload, VolumeRef::acquire(&volume), conn);
        pool.submit(cmd);
    }

    teardown(&volume, conn);
    let _ = ack_handle.join();
}

/// Reads the first frame off `stream`, expecting HANDSHAKE with the
/// volume name as payload, and resolves it against `registry`
/// (`spec.md` §4.D). Returns `None` (and has already closed the logical
/// connection) on any failure.
pub(crate) fn handshake(stream: &mut TcpStream, registry: &VolumeRegistry) -> Option<Arc<VolumeInfo>> {
    let header = match wire::read_header(stream) {
        Ok(h) => h,
        Err(e) => {
            info!(error = %e, "failed to read handshake header");
            return None;
        },
    };
    if header.opcode != Opcode::Handshake {
        warn!(opcode = ?header.opcode, "first frame was not HANDSHAKE, closing");
        return None;
    }
    let mut name_buf = vec![0u8; header.len as usize];
    if let Err(e) = wire::read_exact(stream, &mut name_buf) {
        info!(error = %e, "failed to read handshake volume name");
        return None;
    }
    let name = match String::from_utf8(name_buf) {
        Ok(n) => n,
        Err(_) => {
            warn!("handshake volume name was not valid utf-8");
            return None;
        },
    };
    match registry.lookup(&name) {
        Some(v) => Some(v),
        None => {
            warn!(volume = %name, "handshake for unknown volume");
            None
        },
    }
}

/// Binds an ack-sender to `volume` for `conn` and spawns it, sharing the
/// exact machinery a plain data-connection uses (`spec.md` §4.D). The
/// donor scanner reuses this too: once it resolves a volume off a
/// HANDSHAKE, it needs the very same drain-and-write loop to deliver the
/// READ replies and REBUILD_STEP_DONE sentinels it fabricates
/// (`spec.md` §4.E "Donor"). Returns `None` (connection already
/// rejected/closed) if a sender is already bound or the stream can't be
/// cloned.
pub(crate) fn bind_and_spawn_ack_sender(
    stream: &TcpStream,
    conn: ConnId,
    volume: &Arc<VolumeInfo>,
) -> Option<std::thread::JoinHandle<()>> {
    if !volume.bind_ack_sender() {
        warn!(volume = %volume.name, "volume already has a bound ack-sender, rejecting connection");
        return None;
    }
    let ack_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to clone stream for ack-sender");
            volume.unbind_ack_sender();
            return None;
        },
    };
    let ack_volume = VolumeRef::acquire(volume);
    Some(
        std::thread::Builder::new()
            .name(format!("replica-ack-{conn}"))
            .spawn(move || run_ack_sender(ack_stream, conn, ack_volume))
            .expect("failed to spawn ack-sender thread"),
    )
}

/// Shutdown of a data-connection (`spec.md` §4.D): unbind the
/// ack-sender, drop every queued command belonging to `conn`, then wait
/// until the ack-sender is no longer mid-write for this connection.
pub(crate) fn teardown(volume: &VolumeInfo, conn: ConnId) {
    volume.unbind_ack_sender();
    let dropped = volume.remove_pending_cmds_to_ack(conn);
    drop(dropped);
    while !volume.ack_sender_idle_for(conn) {
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// The ack-sender (`spec.md` §4.D): drains `complete_queue`, writing
/// each reply back to the peer, until the volume is unbound from this
/// connection and the queue is empty.
pub(crate) fn run_ack_sender(mut stream: TcpStream, conn: ConnId, volume: VolumeRef) {
    let span = info_span!("ack-sender", conn, volume = %volume.name);
    let _enter = span.enter();

    while let Some(mut cmd) = volume.next_to_ack() {
        let result = write_reply(&mut stream, &mut cmd);
        volume.clear_in_ack();
        if let Err(e) = result {
            warn!(error = %e, "ack-sender write failed, terminating");
            break;
        }
    }
}

/// Writes one command's reply: header, then (for an OK READ) the data
/// payload, then (if metadata was collected) the trailing
/// `{offset,len,io_num}` triples (`spec.md` §6, §4.D step 3).
fn write_reply(stream: &mut TcpStream, cmd: &mut Command) -> Result<(), wire::WireError> {
    if let Some(entries) = &cmd.metadata_desc {
        cmd.header.meta_len = (entries.len() * 24) as u32;
    } else {
        cmd.header.meta_len = 0;
    }

    wire::write_header(stream, &cmd.header)?;

    if cmd.header.opcode == Opcode::Read && cmd.header.status == Status::Ok {
        if let Some(data) = &cmd.payload {
            wire::write_exact(stream, data)?;
        }
    }

    if let Some(entries) = &cmd.metadata_desc {
        let mut buf = Vec::with_capacity(entries.len() * 24);
        for e in entries {
            buf.extend_from_slice(&e.offset.to_le_bytes());
            buf.extend_from_slice(&e.len.to_le_bytes());
            buf.extend_from_slice(&e.io_num.to_le_bytes());
        }
        wire::write_exact(stream, &buf)?;
    }

    Ok(())
}
