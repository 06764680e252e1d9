//! Replica data-plane core: wire protocol, worker dispatch and rebuild
//! engine for a replicated block volume (`spec.md` §1-§2).
//!
//! This crate is a library linked into a daemon; it does not open a
//! `main` of its own. [`engine::ReplicaEngine`] is the entry point a
//! daemon wires up: it owns the volume registry, the worker pool, the
//! checkpoint timer and the acceptor, and exposes `spawn_rebuild_recipient`
//! for the management plane to drive rebuilds.

pub mod acceptor;
pub mod checkpoint;
pub mod command;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod logging;
pub mod rebuild;
pub mod store;
pub mod volume;
pub mod wire;
pub mod worker;
pub mod worker_pool;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use config::ReplicaEngineConfig;
pub use error::ReplicaError;
