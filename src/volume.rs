//! `VolumeInfo` and the volume registry (`spec.md` §3).
//!
//! `VolumeInfo` mirrors the teacher crate's nexus/bdev state structs: a
//! plain data holder with small, purpose-specific locks rather than one
//! coarse mutex around everything, and `parking_lot` primitives throughout
//! (the teacher uses `parking_lot` for exactly this reason — see
//! `rebuild_instances.rs`).

use std::{
    collections::{HashMap, VecDeque},
    ops::Deref,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use parking_lot::{Condvar, Mutex};

use crate::{command::Command, store::StoreHandle};

/// Lifecycle state of a volume (`spec.md` §3). `Offline` is a permanent
/// shutdown marker: once set, it is never cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    Init,
    Online,
    Offline,
}

/// Progress of the most recent (or in-progress) rebuild of this volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RebuildStatus {
    #[default]
    Init,
    InProgress,
    Done,
    Errored,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// Per-volume read/write/sync counters (`spec.md` §3, surfaced read-only
/// via [`VolumeInfo::snapshot_counters`] per `SPEC_FULL.md` §B).
#[derive(Debug, Default)]
pub struct Counters {
    pub read_req: AtomicU64,
    pub write_req: AtomicU64,
    pub sync_req: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CountersSnapshot {
    pub read_req: u64,
    pub write_req: u64,
    pub sync_req: u64,
}

/// Rebuild bookkeeping (`spec.md` §3 `rebuild_info`), guarded by
/// `rebuild_mtx`. `status` and `health` live here too so the terminal
/// "done_cnt reaches cnt -> decide health" transition (§3 invariant 5)
/// happens under one lock acquisition.
#[derive(Debug)]
struct RebuildBookkeeping {
    status: RebuildStatus,
    health: HealthStatus,
    rebuild_cnt: u32,
    rebuild_done_cnt: u32,
    rebuild_failed_cnt: u32,
}

impl Default for RebuildBookkeeping {
    fn default() -> Self {
        Self {
            status: RebuildStatus::Init,
            health: HealthStatus::Degraded,
            rebuild_cnt: 0,
            rebuild_done_cnt: 0,
            rebuild_failed_cnt: 0,
        }
    }
}

/// State guarded by `VolumeInfo.mutex` (`spec.md` §5): the completion
/// queue, the ack-sender's waiting flag and presence bit, and the
/// connection id of whatever command the ack-sender currently has in
/// flight.
#[derive(Debug, Default)]
struct AckState {
    complete_queue: VecDeque<Command>,
    io_ack_waiting: bool,
    is_io_ack_sender_created: bool,
    /// Connection id of the command the ack-sender is currently writing,
    /// if any (`zio_cmd_in_ack` in `spec.md` §3, used by teardown).
    zio_cmd_in_ack: Option<u64>,
}

pub struct VolumeInfo {
    pub name: String,
    pub store_handle: StoreHandle,
    state: Mutex<VolumeState>,
    rebuild: Mutex<RebuildBookkeeping>,
    running_ionum: AtomicU64,
    checkpointed_ionum: AtomicU64,
    checkpointed_time: Mutex<Instant>,
    /// Seconds; `0` means the checkpoint timer skips this volume
    /// (`spec.md` §3).
    update_ionum_interval: AtomicU64,
    ack: Mutex<AckState>,
    io_ack_cond: Condvar,
    pub counters: Counters,
    refcount: AtomicUsize,
}

impl VolumeInfo {
    pub fn new(name: impl Into<String>, store_handle: StoreHandle) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            store_handle,
            state: Mutex::new(VolumeState::Init),
            rebuild: Mutex::new(RebuildBookkeeping::default()),
            running_ionum: AtomicU64::new(0),
            checkpointed_ionum: AtomicU64::new(0),
            checkpointed_time: Mutex::new(Instant::now()),
            update_ionum_interval: AtomicU64::new(0),
            ack: Mutex::new(AckState::default()),
            io_ack_cond: Condvar::new(),
            counters: Counters::default(),
            refcount: AtomicUsize::new(0),
        })
    }

    pub fn state(&self) -> VolumeState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: VolumeState) {
        *self.state.lock() = state;
    }

    pub fn mark_online(&self) {
        self.set_state(VolumeState::Online);
    }

    /// Invariant 2 (`spec.md` §3): an offline volume accepts no new work.
    pub fn is_offline(&self) -> bool {
        self.state() == VolumeState::Offline
    }

    pub fn running_ionum(&self) -> u64 {
        self.running_ionum.load(Ordering::SeqCst)
    }

    /// Advances `running_ionum` to `max(running_ionum, io_num)` via a
    /// compare-and-swap loop (`spec.md` §4.C, step 3 WRITE dispatch).
    pub fn advance_running_ionum(&self, io_num: u64) {
        let mut current = self.running_ionum.load(Ordering::SeqCst);
        while io_num > current {
            match self.running_ionum.compare_exchange_weak(
                current,
                io_num,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn checkpointed_ionum(&self) -> u64 {
        self.checkpointed_ionum.load(Ordering::SeqCst)
    }

    /// Only the checkpoint timer calls this (`spec.md` §5).
    pub fn set_checkpointed_ionum(&self, value: u64) {
        self.checkpointed_ionum.store(value, Ordering::SeqCst);
    }

    pub fn checkpointed_time(&self) -> Instant {
        *self.checkpointed_time.lock()
    }

    pub fn set_checkpointed_time(&self, when: Instant) {
        *self.checkpointed_time.lock() = when;
    }

    pub fn update_ionum_interval_secs(&self) -> u64 {
        self.update_ionum_interval.load(Ordering::SeqCst)
    }

    pub(crate) fn set_update_ionum_interval_secs(&self, secs: u64) {
        self.update_ionum_interval.store(secs, Ordering::SeqCst);
    }

    pub fn health(&self) -> HealthStatus {
        self.rebuild.lock().health
    }

    pub fn is_healthy(&self) -> bool {
        self.health() == HealthStatus::Healthy
    }

    pub fn rebuild_status(&self) -> RebuildStatus {
        self.rebuild.lock().status
    }

    pub fn set_rebuild_status(&self, status: RebuildStatus) {
        self.rebuild.lock().status = status;
    }

    /// Called once by the management plane before spawning recipient
    /// tasks (`spec.md` §9 open question: "the management plane has
    /// already set `rebuild_cnt` before spawning recipients").
    pub fn begin_rebuild(&self, donor_count: u32) {
        let mut r = self.rebuild.lock();
        r.status = RebuildStatus::InProgress;
        r.rebuild_cnt = donor_count;
        r.rebuild_done_cnt = 0;
        r.rebuild_failed_cnt = 0;
    }

    /// Rebuild-abort path (`spec.md` §4.E step 4): mark `ERRORED` and bump
    /// `rebuild_failed_cnt`.
    pub fn mark_rebuild_errored(&self) {
        let mut r = self.rebuild.lock();
        r.status = RebuildStatus::Errored;
        r.rebuild_failed_cnt += 1;
    }

    /// Terminal bookkeeping for one recipient task (`spec.md` §4.E step
    /// 5). Returns `true` iff this call observed the terminal transition
    /// (`rebuild_done_cnt == rebuild_cnt`), so the caller can decide
    /// whether to wake the checkpoint timer.
    pub fn finish_rebuild_task(&self) -> bool {
        let mut r = self.rebuild.lock();
        r.rebuild_done_cnt += 1;
        if r.rebuild_done_cnt == r.rebuild_cnt {
            if r.rebuild_failed_cnt > 0 {
                r.status = RebuildStatus::Failed;
            } else {
                r.status = RebuildStatus::Done;
                r.health = HealthStatus::Healthy;
            }
            true
        } else {
            false
        }
    }

    pub fn snapshot_counters(&self) -> CountersSnapshot {
        CountersSnapshot {
            read_req: self.counters.read_req.load(Ordering::Relaxed),
            write_req: self.counters.write_req.load(Ordering::Relaxed),
            sync_req: self.counters.sync_req.load(Ordering::Relaxed),
        }
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::SeqCst)
    }

    // -- ack-sender binding (§4.D) --

    /// `true` iff an ack-sender is already bound to this volume. The
    /// receiver rejects a second HANDSHAKE while one is alive
    /// (`spec.md` §4.D).
    pub fn has_ack_sender(&self) -> bool {
        self.ack.lock().is_io_ack_sender_created
    }

    pub fn bind_ack_sender(&self) -> bool {
        let mut a = self.ack.lock();
        if a.is_io_ack_sender_created {
            return false;
        }
        a.is_io_ack_sender_created = true;
        true
    }

    /// Unbinds the ack-sender and wakes it if it is parked waiting for
    /// work, so a teardown with nothing left to ack still lets the
    /// ack-sender thread observe the unbind and exit promptly rather
    /// than waiting on a condvar no one will signal again.
    pub fn unbind_ack_sender(&self) {
        let mut a = self.ack.lock();
        a.is_io_ack_sender_created = false;
        a.io_ack_waiting = false;
        self.io_ack_cond.notify_all();
    }

    /// Invariant from `spec.md` §4.C step 5 / §8 P2: a command is only
    /// ever enqueued while holding the same lock acquisition that checks
    /// `is_io_ack_sender_created`. Returns the command back to the caller
    /// (to free) if there is no ack-sender to receive it.
    pub fn complete(&self, cmd: Command) -> Option<Command> {
        let mut a = self.ack.lock();
        if !a.is_io_ack_sender_created {
            return Some(cmd);
        }
        a.complete_queue.push_back(cmd);
        if a.io_ack_waiting {
            a.io_ack_waiting = false;
            self.io_ack_cond.notify_one();
        }
        None
    }

    /// Ack-sender's main-loop pop (`spec.md` §4.D step 1-2): blocks on
    /// the condvar while the queue is empty, then records the popped
    /// command's connection id in `zio_cmd_in_ack` before releasing the
    /// lock, matching the spec's "under the mutex" sequencing. Returns
    /// `None` once the ack-sender has been unbound and the queue has
    /// drained, telling the ack-sender loop to exit.
    pub fn next_to_ack(&self) -> Option<Command> {
        let mut a = self.ack.lock();
        loop {
            if let Some(cmd) = a.complete_queue.pop_front() {
                a.zio_cmd_in_ack = Some(cmd.conn);
                return Some(cmd);
            }
            if !a.is_io_ack_sender_created {
                return None;
            }
            a.io_ack_waiting = true;
            self.io_ack_cond.wait(&mut a);
        }
    }

    /// Non-blocking peek used by tests: `true` iff there is nothing
    /// queued for the ack-sender right now.
    pub fn complete_queue_is_empty(&self) -> bool {
        self.ack.lock().complete_queue.is_empty()
    }

    pub fn clear_in_ack(&self) {
        self.ack.lock().zio_cmd_in_ack = None;
    }

    /// Teardown helper (`spec.md` §4.D "Shutdown of a data-connection"):
    /// drains every queued command whose `conn` matches the dying
    /// connection and returns them to the caller to free.
    pub fn remove_pending_cmds_to_ack(&self, conn: u64) -> Vec<Command> {
        let mut a = self.ack.lock();
        let (matching, rest): (VecDeque<Command>, VecDeque<Command>) =
            a.complete_queue.drain(..).partition(|cmd| cmd.conn == conn);
        a.complete_queue = rest;
        matching.into_iter().collect()
    }

    /// `true` once `zio_cmd_in_ack` is either empty or belongs to a
    /// different connection than `conn` — the condition the teardown
    /// spin-wait polls (`spec.md` §4.D, §9 "prefer a proper condvar").
    pub fn ack_sender_idle_for(&self, conn: u64) -> bool {
        match self.ack.lock().zio_cmd_in_ack {
            Some(in_flight) => in_flight != conn,
            None => true,
        }
    }
}

/// RAII volume reference (`spec.md` §3 invariant 4: "incremented before a
/// worker is handed a command and decremented exactly once when the
/// worker terminates"). Replaces the spec's manual increment/decrement
/// pairing with ordinary Rust ownership: acquiring one bumps the
/// refcount, dropping it releases exactly once.
pub struct VolumeRef(Arc<VolumeInfo>);

impl VolumeRef {
    pub fn acquire(volume: &Arc<VolumeInfo>) -> Self {
        volume.refcount.fetch_add(1, Ordering::SeqCst);
        Self(volume.clone())
    }
}

impl Clone for VolumeRef {
    fn clone(&self) -> Self {
        Self::acquire(&self.0)
    }
}

impl Drop for VolumeRef {
    fn drop(&mut self) {
        self.0.refcount.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Deref for VolumeRef {
    type Target = VolumeInfo;
    fn deref(&self) -> &VolumeInfo {
        &self.0
    }
}

/// The volume registry (`spec.md` §1: "the volume registry (`VolumeRegistry`)
/// providing lookup and refcounting" is out of scope as an external
/// collaborator; this crate still needs a concrete one to drive the
/// acceptor, checkpoint timer and tests against).
#[derive(Default)]
pub struct VolumeRegistry {
    volumes: Mutex<HashMap<String, Arc<VolumeInfo>>>,
}

impl VolumeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, volume: Arc<VolumeInfo>) {
        self.volumes.lock().insert(volume.name.clone(), volume);
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<VolumeInfo>> {
        self.volumes.lock().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<VolumeInfo>> {
        self.volumes.lock().remove(name)
    }

    /// Walked by the checkpoint timer with the registry lock held
    /// (`spec.md` §5: "no blocking calls under the registry lock" — the
    /// callback must not block).
    pub fn for_each(&self, mut f: impl FnMut(&Arc<VolumeInfo>)) {
        let volumes = self.volumes.lock();
        for volume in volumes.values() {
            f(volume);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_ionum_is_a_monotonic_max() {
        let vol = VolumeInfo::new("v1", 0);
        vol.advance_running_ionum(5);
        vol.advance_running_ionum(3);
        vol.advance_running_ionum(9);
        assert_eq!(vol.running_ionum(), 9);
    }

    #[test]
    fn refcount_round_trips_to_zero() {
        let vol = VolumeInfo::new("v1", 0);
        {
            let r1 = VolumeRef::acquire(&vol);
            let r2 = r1.clone();
            assert_eq!(vol.refcount(), 2);
            drop(r1);
            drop(r2);
        }
        assert_eq!(vol.refcount(), 0);
    }

    #[test]
    fn second_ack_sender_is_rejected() {
        let vol = VolumeInfo::new("v1", 0);
        assert!(vol.bind_ack_sender());
        assert!(!vol.bind_ack_sender());
        vol.unbind_ack_sender();
        assert!(vol.bind_ack_sender());
    }

    #[test]
    fn rebuild_from_two_donors_goes_healthy() {
        let vol = VolumeInfo::new("v1", 0);
        vol.begin_rebuild(2);
        assert!(!vol.finish_rebuild_task());
        assert!(vol.finish_rebuild_task());
        assert_eq!(vol.rebuild_status(), RebuildStatus::Done);
        assert!(vol.is_healthy());
    }

    #[test]
    fn one_failed_donor_fails_the_rebuild() {
        let vol = VolumeInfo::new("v1", 0);
        vol.begin_rebuild(2);
        vol.mark_rebuild_errored();
        assert!(!vol.finish_rebuild_task());
        assert!(vol.finish_rebuild_task());
        assert_eq!(vol.rebuild_status(), RebuildStatus::Failed);
        assert!(!vol.is_healthy());
    }
}
