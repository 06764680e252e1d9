//! A small bounded thread pool that executes [`Command`]s
//! (`spec.md` §4.C, §5: "worker-per-command is acceptable; a bounded pool
//! is a valid implementation choice"). Grounded on the teacher crate's use
//! of `crossbeam` channels for cross-thread work handoff
//! (`rebuild_instances.rs`, `rebuild_task.rs`).

use std::sync::Arc;

use crossbeam::channel::{bounded, Sender};
use tracing::error_span;

use crate::{command::Command, store::VolumeStore};

/// Dispatches commands to a fixed set of worker threads, each running
/// [`crate::worker::dispatch`] in a loop until the pool is dropped.
pub struct WorkerPool {
    tx: Sender<Command>,
}

impl WorkerPool {
    pub fn new(threads: usize, store: Arc<dyn VolumeStore>) -> Self {
        let threads = threads.max(1);
        let (tx, rx) = bounded::<Command>(threads * 4);
        for idx in 0 .. threads {
            let rx = rx.clone();
            let store = store.clone();
            std::thread::Builder::new()
                .name(format!("replica-worker-{idx}"))
                .spawn(move || {
                    while let Ok(cmd) = rx.recv() {
                        let span = error_span!("worker", conn = cmd.conn, volume = %cmd.volume.name);
                        let _enter = span.enter();
                        crate::worker::dispatch(cmd, store.as_ref());
                    }
                })
                .expect("failed to spawn worker thread");
        }
        Self { tx }
    }

    /// Enqueues `cmd` for execution by some worker thread. Never blocks
    /// the caller beyond the pool's bounded capacity, matching the
    /// spec's "one task per command" data flow without letting an
    /// unbounded backlog build up (`spec.md` §2).
    pub fn submit(&self, cmd: Command) {
        if self.tx.send(cmd).is_err() {
            tracing::error!("worker pool is shut down, dropping command");
        }
    }
}
