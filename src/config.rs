//! Knobs the daemon supplies to the engine (`spec.md` §6: "The daemon
//! supplies: io_port, rebuild_port, step_size, and a logging sink").
//! Grounded on `MayastorCliArgs`/`MayastorEnvironment` in the teacher
//! crate's `core/env.rs`: a plain struct with sane defaults and a
//! `clap::Parser` front end, not a hidden global.

use byte_unit::Byte;
use clap::Parser;

/// Default I/O data-port. Out of scope in `spec.md` itself, but every
/// implementation needs *some* default.
pub const DEFAULT_IO_PORT: u16 = 11900;
pub const DEFAULT_REBUILD_PORT: u16 = 11901;
/// `spec.md` GLOSSARY: "STEP_SIZE — granularity (bytes) at which the
/// recipient asks the donor for diffs; default 10 GiB."
pub const DEFAULT_STEP_SIZE: u64 = 10 * 1024 * 1024 * 1024;
/// `spec.md` §4.F: "ceiling 600 s".
pub const DEFAULT_CHECKPOINT_CEILING_SECS: u64 = 600;

fn parse_byte_size(src: &str) -> Result<u64, String> {
    Byte::from_str(src)
        .map(|b| b.get_bytes() as u64)
        .map_err(|e| format!("invalid size {src:?}: {e}"))
}

fn parse_checkpoint_ceiling(src: &str) -> Result<u64, String> {
    src.parse::<humantime::Duration>()
        .map(|d| d.as_secs())
        .map_err(|e| format!("invalid duration {src:?}: {e}"))
}

/// Engine-level configuration. Implements [`Default`] with the values
/// above, and a `clap::Parser` derive so `replica-daemon` can build one
/// straight from CLI flags / environment variables.
#[derive(Debug, Clone, Parser)]
#[command(name = "replica-engine", about = "Replica data-plane core")]
pub struct ReplicaEngineConfig {
    /// TCP port client connections (HANDSHAKE/READ/WRITE/SYNC) are
    /// accepted on.
    #[arg(long, env = "REPLICA_IO_PORT", default_value_t = DEFAULT_IO_PORT)]
    pub io_port: u16,

    /// TCP port rebuild (donor) connections are accepted on.
    #[arg(long, env = "REPLICA_REBUILD_PORT", default_value_t = DEFAULT_REBUILD_PORT)]
    pub rebuild_port: u16,

    /// Rebuild step granularity in bytes (`spec.md` GLOSSARY
    /// `STEP_SIZE`). Accepts byte-unit suffixes, e.g. `10GiB`.
    #[arg(
        long,
        env = "REPLICA_STEP_SIZE",
        value_parser = parse_byte_size,
        default_value = "10GiB",
    )]
    pub step_size: u64,

    /// Number of worker threads executing commands against the volume
    /// store (`spec.md` §5: "a bounded pool is a valid implementation
    /// choice").
    #[arg(long, env = "REPLICA_WORKER_THREADS", default_value_t = 8)]
    pub worker_threads: usize,

    /// Ceiling on how long the checkpoint timer ever sleeps between
    /// wakes (`spec.md` §4.F: "ceiling 600 s"). Accepts `humantime`
    /// durations, e.g. `600s` or `10m`.
    #[arg(
        long,
        env = "REPLICA_CHECKPOINT_CEILING",
        value_parser = parse_checkpoint_ceiling,
        default_value = "600s",
    )]
    pub checkpoint_interval_ceiling: u64,

    /// `tracing_subscriber::EnvFilter` directive, e.g. `info` or
    /// `replica_engine=debug`.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,
}

impl Default for ReplicaEngineConfig {
    fn default() -> Self {
        Self {
            io_port: DEFAULT_IO_PORT,
            rebuild_port: DEFAULT_REBUILD_PORT,
            step_size: DEFAULT_STEP_SIZE,
            worker_threads: 8,
            checkpoint_interval_ceiling: DEFAULT_CHECKPOINT_CEILING_SECS,
            log_filter: "info".into(),
        }
    }
}

impl ReplicaEngineConfig {
    /// Validates the knobs a daemon can't reasonably recover from at
    /// runtime (zero-sized steps, clashing ports).
    pub fn validate(&self) -> Result<(), String> {
        if self.step_size == 0 {
            return Err("step_size must be greater than zero".into());
        }
        if self.io_port == self.rebuild_port {
            return Err("io_port and rebuild_port must differ".into());
        }
        if self.worker_threads == 0 {
            return Err("worker_threads must be greater than zero".into());
        }
        Ok(())
    }
}
