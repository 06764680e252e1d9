//! Top-level wiring: registry + worker pool + checkpoint service + acceptor
//! behind one handle, with a single `shutdown()` entry point
//! (`SPEC_FULL.md` §B, "Graceful engine shutdown"; `spec.md` §9's
//! `CheckpointService` design note extended to the whole core).

use std::{net::SocketAddr, sync::Arc, thread::JoinHandle, time::Duration};

use crate::{
    acceptor::{self, AcceptorHandle},
    checkpoint::CheckpointService,
    config::ReplicaEngineConfig,
    error::ReplicaError,
    rebuild,
    store::VolumeStore,
    volume::{VolumeInfo, VolumeRegistry},
    worker_pool::WorkerPool,
};

/// Owns every long-lived task in the core (`spec.md` §5: "one acceptor,
/// one checkpoint timer, ... a worker pool") and the collaborators they
/// share (`spec.md` §1: `VolumeStore`, `VolumeRegistry`).
pub struct ReplicaEngine {
    registry: Arc<VolumeRegistry>,
    store: Arc<dyn VolumeStore>,
    pool: Arc<WorkerPool>,
    checkpoint: Arc<CheckpointService>,
    step_size: u64,
    checkpoint_thread: Option<JoinHandle<()>>,
    acceptor_thread: Option<JoinHandle<Result<(), ReplicaError>>>,
    acceptor_handle: Option<AcceptorHandle>,
}

impl ReplicaEngine {
    /// Validates `config`, then starts the checkpoint timer and the
    /// acceptor (each on its own thread) and returns once the acceptor
    /// has bound both listen sockets.
    pub fn start(config: ReplicaEngineConfig, store: Arc<dyn VolumeStore>) -> Result<Self, ReplicaError> {
        config.validate().map_err(|reason| ReplicaError::InvalidConfig { reason })?;

        let registry = VolumeRegistry::new();
        let pool = Arc::new(WorkerPool::new(config.worker_threads, store.clone()));
        let checkpoint = CheckpointService::with_ceiling(
            registry.clone(),
            store.clone(),
            Duration::from_secs(config.checkpoint_interval_ceiling),
        );
        let checkpoint_thread = checkpoint.init();

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let acceptor_config = config.clone();
        let acceptor_registry = registry.clone();
        let acceptor_store = store.clone();
        let acceptor_pool = pool.clone();
        let acceptor_thread = std::thread::Builder::new()
            .name("replica-acceptor".into())
            .spawn(move || {
                acceptor::run(&acceptor_config, acceptor_registry, acceptor_store, acceptor_pool, |handle| {
                    let _ = ready_tx.send(handle);
                })
            })
            .expect("failed to spawn acceptor thread");
        // Blocks until the acceptor has bound both listen sockets (or
        // dropped the sender on a bind failure, in which case `join()`
        // below will surface the real error).
        let acceptor_handle = ready_rx.recv().ok();

        Ok(Self {
            registry,
            store,
            pool,
            checkpoint,
            step_size: config.step_size,
            checkpoint_thread: Some(checkpoint_thread),
            acceptor_thread: Some(acceptor_thread),
            acceptor_handle,
        })
    }

    pub fn registry(&self) -> &Arc<VolumeRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn VolumeStore> {
        &self.store
    }

    pub fn checkpoint(&self) -> &Arc<CheckpointService> {
        &self.checkpoint
    }

    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Spawns one rebuild-recipient task against `donor_addr`
    /// (`spec.md` §4.E "Recipient": "a dedicated task" per donor). The
    /// caller is expected to have called `volume.begin_rebuild(donor_count)`
    /// before spawning any of a batch's recipient tasks (`spec.md` §9
    /// open question).
    pub fn spawn_rebuild_recipient(
        &self,
        volume: Arc<VolumeInfo>,
        donor_addr: SocketAddr,
    ) -> JoinHandle<()> {
        let store = self.store.clone();
        let checkpoint = self.checkpoint.clone();
        let step_size = self.step_size;
        std::thread::Builder::new()
            .name(format!("replica-rebuild-{}", volume.name))
            .spawn(move || rebuild::run_recipient(volume, donor_addr, store, checkpoint, step_size))
            .expect("failed to spawn rebuild-recipient thread")
    }

    /// Signals the acceptor and checkpoint timer to stop without waiting
    /// for them to exit. Call [`ReplicaEngine::join`] afterwards for an
    /// orderly shutdown.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.acceptor_handle.take() {
            handle.shutdown();
        }
        self.checkpoint.shutdown();
    }

    /// Blocks until the acceptor and checkpoint timer threads have both
    /// exited, consuming the engine. The acceptor's result is propagated
    /// so a daemon can tell a clean `shutdown()` apart from a fatal
    /// readiness error (`spec.md` §4.F).
    pub fn join(mut self) -> Result<(), ReplicaError> {
        let acceptor_result = match self.acceptor_thread.take() {
            Some(t) => t.join().unwrap_or(Ok(())),
            None => Ok(()),
        };
        if let Some(t) = self.checkpoint_thread.take() {
            let _ = t.join();
        }
        acceptor_result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeVolumeStore;

    #[test]
    fn start_binds_both_ports_and_shuts_down_cleanly() {
        let config = ReplicaEngineConfig {
            io_port: 18_300,
            rebuild_port: 18_301,
            worker_threads: 2,
            ..ReplicaEngineConfig::default()
        };
        let store: Arc<dyn VolumeStore> = Arc::new(FakeVolumeStore::new(1024));
        let mut engine = ReplicaEngine::start(config, store).expect("engine should start");
        engine.shutdown();
        engine.join().expect("engine should shut down cleanly");
    }
}
