//! Minimal daemon wiring for `replica_engine` (`spec.md` §1: "each replica
//! embeds this core"; §6: "CLI / environment — out of scope here... the
//! core is a library linked into a daemon"). This binary is the thin
//! collaborator the spec places out of scope, kept separate from the
//! library: it parses configuration, installs logging, supplies a
//! `VolumeStore` implementation and starts the engine.
//!
//! A real daemon links its own on-disk `VolumeStore` and a management-
//! plane control connection that creates/opens volumes and drives
//! rebuilds (`spec.md` §1, "out of scope"). This binary stands in the
//! latter with the in-memory fake behind `test-support`, purely so the
//! crate ships something runnable.

use std::sync::Arc;

use clap::Parser;
use replica_engine::{config::ReplicaEngineConfig, engine::ReplicaEngine, logging, store::VolumeStore};
use tracing::{error, info};

fn main() {
    let config = ReplicaEngineConfig::parse();
    if let Err(reason) = config.validate() {
        eprintln!("invalid configuration: {reason}");
        std::process::exit(1);
    }
    logging::init(&config.log_filter);

    let store = build_store();

    info!(io_port = config.io_port, rebuild_port = config.rebuild_port, "starting replica engine");
    let engine = match ReplicaEngine::start(config, store) {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "replica engine failed to start");
            std::process::exit(1);
        },
    };

    // A production supervisor wires SIGTERM/SIGINT to `engine.shutdown()`
    // here; this demo binary just runs until the acceptor hits a fatal
    // readiness error (`spec.md` §4.F).
    if let Err(e) = engine.join() {
        error!(error = %e, "replica engine exited with an error");
        std::process::exit(1);
    }
}

#[cfg(feature = "test-support")]
fn build_store() -> Arc<dyn VolumeStore> {
    use replica_engine::test_support::FakeVolumeStore;
    const DEMO_VOLUME_SIZE: u64 = 64 * 1024 * 1024 * 1024;
    Arc::new(FakeVolumeStore::new(DEMO_VOLUME_SIZE))
}

#[cfg(not(feature = "test-support"))]
fn build_store() -> Arc<dyn VolumeStore> {
    eprintln!(
        "replica-daemon has no VolumeStore implementation linked in; rebuild with \
         --features test-support for an in-memory demo store, or link a real one"
    );
    std::process::exit(1);
}
