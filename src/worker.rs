//! The worker: executes exactly one [`Command`] against the volume store
//! and disposes or enqueues it (`spec.md` §4.C).
//!
//! A worker never lets an error escape — store failures become a
//! `FAILED` reply status, never a propagated `Result` (`spec.md` §7). The
//! only thing callers observe is the final [`Status`] of the command,
//! which the rebuild recipient uses to decide whether to abort.

use tracing::{debug, warn};

use crate::{
    command::Command,
    store::VolumeStore,
    volume::RebuildStatus,
    wire::{Opcode, Status},
};

const RW_HEADER_SIZE: usize = 16;

/// Executes `cmd` against `store` to completion, applying the ack policy
/// from `spec.md` §4.C step 5, and returns the final reply status so
/// synchronous callers (the rebuild recipient) can decide to abort.
pub fn dispatch(mut cmd: Command, store: &dyn VolumeStore) -> Status {
    if cmd.volume.is_offline() {
        cmd.header.status = Status::Failed;
        cmd.header.len = 0;
        finish(cmd);
        return Status::Failed;
    }

    let want_metadata = needs_metadata(&cmd);

    let status = match cmd.header.opcode {
        Opcode::Read => do_read(&mut cmd, store, want_metadata),
        Opcode::Write => do_write(&mut cmd, store),
        Opcode::Sync => do_sync(&mut cmd, store),
        Opcode::RebuildStepDone => Status::Ok,
        // OPEN is allocated with a payload slot (`spec.md` §3) but is
        // management-plane-only on the data channel (`SPEC_FULL.md` §B
        // open-question resolution); HANDSHAKE/REBUILD_STEP/
        // REBUILD_COMPLETE never reach the worker, they are handled by
        // the receiver/donor state machines directly.
        Opcode::Open
        | Opcode::Handshake
        | Opcode::RebuildStep
        | Opcode::RebuildComplete => {
            warn!(opcode = ?cmd.header.opcode, "opcode not valid for worker dispatch");
            cmd.header.len = 0;
            Status::Failed
        },
    };

    cmd.header.status = status;
    if status == Status::Failed {
        cmd.header.len = 0;
    }

    finish(cmd);
    status
}

fn needs_metadata(cmd: &Command) -> bool {
    let fully_rebuilt = cmd.volume.rebuild_status() == RebuildStatus::Done;
    let non_rebuild = !cmd.header.is_rebuild();
    if non_rebuild && fully_rebuilt && !cmd.header.wants_metadata() {
        return false;
    }
    true
}

fn do_read(cmd: &mut Command, store: &dyn VolumeStore, want_metadata: bool) -> Status {
    let len = cmd.header.len as usize;
    let mut buf = vec![0u8; len];
    match store.read(
        cmd.volume.store_handle,
        &mut buf,
        cmd.header.offset,
        cmd.header.len,
        want_metadata,
    ) {
        Ok(metadata) => {
            cmd.payload = Some(buf);
            if want_metadata {
                cmd.metadata_desc = Some(metadata);
            }
            cmd.volume.counters.read_req.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Status::Ok
        },
        Err(e) => {
            warn!(error = %e, volume = %cmd.volume.name, "read failed");
            Status::Failed
        },
    }
}

/// Parses the write payload as a sequence of `{rw_header, data}` records
/// (`spec.md` §6) and applies each in turn, advancing `running_ionum` by
/// CAS after every record. Stops at the first failed record — either a
/// framing error or a store failure.
fn do_write(cmd: &mut Command, store: &dyn VolumeStore) -> Status {
    let Some(payload) = cmd.payload.take() else {
        return Status::Failed;
    };
    let is_rebuild = cmd.header.is_rebuild();
    let mut pos = 0usize;
    let mut offset = cmd.header.offset;

    while pos < payload.len() {
        if payload.len() - pos < RW_HEADER_SIZE {
            warn!(volume = %cmd.volume.name, "write record truncated: short rw_header");
            return Status::Failed;
        }
        let io_num = u64::from_le_bytes(payload[pos .. pos + 8].try_into().unwrap());
        let rec_len = u64::from_le_bytes(payload[pos + 8 .. pos + 16].try_into().unwrap());
        pos += RW_HEADER_SIZE;

        let rec_len_usize = rec_len as usize;
        if payload.len() - pos < rec_len_usize {
            warn!(volume = %cmd.volume.name, "write record truncated: short data");
            return Status::Failed;
        }
        let data = &payload[pos .. pos + rec_len_usize];
        pos += rec_len_usize;

        if let Err(e) = store.write(
            cmd.volume.store_handle,
            data,
            offset,
            rec_len,
            io_num,
            is_rebuild,
        ) {
            warn!(error = %e, volume = %cmd.volume.name, io_num, "write failed");
            return Status::Failed;
        }
        cmd.volume.advance_running_ionum(io_num);
        offset += rec_len;
    }

    cmd.volume.counters.write_req.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    Status::Ok
}

fn do_sync(cmd: &mut Command, store: &dyn VolumeStore) -> Status {
    match store.flush(cmd.volume.store_handle) {
        Ok(()) => {
            cmd.volume.counters.sync_req.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Status::Ok
        },
        Err(e) => {
            warn!(error = %e, volume = %cmd.volume.name, "flush failed");
            Status::Failed
        },
    }
}

/// Ack policy (`spec.md` §4.C step 5). Rebuild-flagged writes never get
/// an ack — the command is simply dropped. Everything else is handed to
/// the volume's completion queue; if there is no live ack-sender the
/// command is dropped there instead.
fn finish(cmd: Command) {
    if cmd.header.is_rebuild() && cmd.header.opcode == Opcode::Write {
        debug!(volume = %cmd.volume.name, "rebuild write completed, no ack sent");
        return;
    }
    if let Some(dropped) = cmd.volume.complete(cmd) {
        debug!(volume = %dropped.volume.name, "no ack-sender bound, dropping completed command");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::Command,
        test_support::FakeVolumeStore,
        volume::{VolumeInfo, VolumeRef},
        wire::{Flags, Header},
    };

    fn setup() -> (std::sync::Arc<VolumeInfo>, FakeVolumeStore) {
        let store = FakeVolumeStore::new(1 << 20);
        let vol = VolumeInfo::new("v1", store.handle());
        vol.mark_online();
        (vol, store)
    }

    #[test]
    fn write_then_read_round_trips() {
        let (vol, store) = setup();
        let conn = 1;

        let mut payload = Vec::new();
        payload.extend_from_slice(&7u64.to_le_bytes());
        payload.extend_from_slice(&8u64.to_le_bytes());
        payload.extend_from_slice(b"ABCDEFGH");

        let mut header = Header::request(Opcode::Write);
        header.offset = 0;
        header.len = payload.len() as u64;
        let cmd = Command::new(header, Some(payload), VolumeRef::acquire(&vol), conn);
        assert_eq!(dispatch(cmd, &store), Status::Ok);

        let mut rheader = Header::request(Opcode::Read);
        rheader.offset = 0;
        rheader.len = 8;
        rheader.flags = Flags::READ_METADATA;
        let rcmd = Command::new(rheader, None, VolumeRef::acquire(&vol), conn);
        assert_eq!(dispatch(rcmd, &store), Status::Ok);

        assert_eq!(vol.running_ionum(), 7);
    }

    #[test]
    fn offline_volume_fails_fast() {
        let (vol, store) = setup();
        vol.set_state(crate::volume::VolumeState::Offline);
        let header = Header::request(Opcode::Sync);
        let cmd = Command::new(header, None, VolumeRef::acquire(&vol), 1);
        assert_eq!(dispatch(cmd, &store), Status::Failed);
    }

    #[test]
    fn rebuild_write_gets_no_ack_and_still_advances_ionum() {
        let (vol, store) = setup();
        assert!(vol.bind_ack_sender());

        let mut payload = Vec::new();
        payload.extend_from_slice(&42u64.to_le_bytes());
        payload.extend_from_slice(&4u64.to_le_bytes());
        payload.extend_from_slice(b"DATA");

        let mut header = Header::request(Opcode::Write);
        header.flags = Flags::REBUILD;
        header.offset = 0;
        header.len = payload.len() as u64;
        let cmd = Command::new(header, Some(payload), VolumeRef::acquire(&vol), 9);
        assert_eq!(dispatch(cmd, &store), Status::Ok);
        assert_eq!(vol.running_ionum(), 42);
        // no ack was queued
        assert!(vol.complete_queue_is_empty());
    }

    #[test]
    fn truncated_write_record_fails() {
        let (vol, store) = setup();
        let mut header = Header::request(Opcode::Write);
        header.offset = 0;
        header.len = 4;
        let cmd = Command::new(header, Some(vec![1, 2, 3, 4]), VolumeRef::acquire(&vol), 1);
        assert_eq!(dispatch(cmd, &store), Status::Failed);
    }
}
