//! Top-level crate error. Only the acceptor and checkpoint timer bubble a
//! `Result` up to the daemon (`spec.md` §4.F, §7); workers and ack-senders
//! translate every failure into a reply status or a silent drop and never
//! surface an error past their own task boundary.

use snafu::Snafu;

use crate::{rebuild::RebuildError, wire::WireError};

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ReplicaError {
    #[snafu(display("failed to bind {port_kind} listen socket on port {port}"))]
    Bind {
        port_kind: &'static str,
        port: u16,
        source: std::io::Error,
    },
    #[snafu(display("readiness poll failed"))]
    PollFailed { source: std::io::Error },
    #[snafu(display("wire error: {source}"))]
    Wire { source: WireError },
    #[snafu(display("rebuild error: {source}"))]
    Rebuild { source: RebuildError },
    #[snafu(display("volume {name} not found"))]
    VolumeNotFound { name: String },
    #[snafu(display("invalid configuration: {reason}"))]
    InvalidConfig { reason: String },
}
