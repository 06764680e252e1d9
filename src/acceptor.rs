//! Acceptor (`spec.md` §4.F): one task multiplexing the I/O and rebuild
//! listen sockets through a readiness notifier, spawning a receiver or a
//! donor-scanner task per accepted connection.

use std::{
    io,
    os::unix::io::{FromRawFd, IntoRawFd},
    sync::Arc,
};

use mio::{net::TcpListener, Events, Interest, Poll, Token, Waker};
use tracing::{error, info, warn};

use crate::{
    config::ReplicaEngineConfig,
    connection,
    error::{BindSnafu, PollFailedSnafu, ReplicaError},
    rebuild,
    store::VolumeStore,
    volume::VolumeRegistry,
    worker_pool::WorkerPool,
};
use snafu::ResultExt;

const IO_TOKEN: Token = Token(0);
const REBUILD_TOKEN: Token = Token(1);
const WAKE_TOKEN: Token = Token(2);

/// Handle used to stop a running acceptor from another thread
/// (`SPEC_FULL.md` §B, "Graceful engine shutdown").
pub struct AcceptorHandle {
    waker: Arc<Waker>,
}

impl AcceptorHandle {
    pub fn shutdown(&self) {
        let _ = self.waker.wake();
    }
}

/// Runs the acceptor loop until `shutdown()` is called on the returned
/// handle or a listen-socket readiness error occurs (`spec.md` §4.F:
/// "Readiness errors on a listen socket are fatal (process exits)" — here
/// that surfaces as an `Err` for the daemon to act on instead of calling
/// `exit` directly, so the library never terminates its host process).
pub fn run(
    config: &ReplicaEngineConfig,
    registry: Arc<VolumeRegistry>,
    store: Arc<dyn VolumeStore>,
    pool: Arc<WorkerPool>,
    ready: impl FnOnce(AcceptorHandle),
) -> Result<(), ReplicaError> {
    let mut io_listener =
        TcpListener::bind(format!("0.0.0.0:{}", config.io_port).parse().unwrap()).context(
            BindSnafu {
                port_kind: "io",
                port: config.io_port,
            },
        )?;
    let mut rebuild_listener =
        TcpListener::bind(format!("0.0.0.0:{}", config.rebuild_port).parse().unwrap()).context(
            BindSnafu {
                port_kind: "rebuild",
                port: config.rebuild_port,
            },
        )?;

    let mut poll = Poll::new().context(PollFailedSnafu)?;
    poll.registry()
        .register(&mut io_listener, IO_TOKEN, Interest::READABLE)
        .context(PollFailedSnafu)?;
    poll.registry()
        .register(&mut rebuild_listener, REBUILD_TOKEN, Interest::READABLE)
        .context(PollFailedSnafu)?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN).context(PollFailedSnafu)?);

    ready(AcceptorHandle {
        waker: waker.clone(),
    });

    let conn_ids = connection::ConnIdAllocator::default();
    let mut events = Events::with_capacity(128);

    info!(io_port = config.io_port, rebuild_port = config.rebuild_port, "acceptor started");
    'outer: loop {
        match poll.poll(&mut events, None) {
            Ok(()) => {},
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ReplicaError::PollFailed { source: e }),
        }

        for event in events.iter() {
            match event.token() {
                IO_TOKEN => {
                    accept_all(&io_listener, |stream| {
                        let conn = conn_ids.next();
                        let registry = registry.clone();
                        let pool = pool.clone();
                        spawn_blocking(stream, move |std_stream| {
                            connection::serve_data_connection(std_stream, conn, registry, pool)
                        });
                    });
                },
                REBUILD_TOKEN => {
                    accept_all(&rebuild_listener, |stream| {
                        let conn = conn_ids.next();
                        let registry = registry.clone();
                        let store = store.clone();
                        spawn_blocking(stream, move |std_stream| {
                            rebuild::serve_rebuild_connection(std_stream, conn, registry, store)
                        });
                    });
                },
                WAKE_TOKEN => {
                    info!("acceptor received shutdown wake");
                    break 'outer;
                },
                _ => {},
            }
        }
    }

    info!("acceptor stopped");
    Ok(())
}

/// Drains every pending connection on `listener` (edge-triggered
/// readiness: one notification can mean several pending connections).
fn accept_all(listener: &TcpListener, mut on_accept: impl FnMut(mio::net::TcpStream)) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                info!(%peer, "accepted connection");
                on_accept(stream);
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "accept failed");
                break;
            },
        }
    }
}

/// Bridges a non-blocking `mio` stream into a blocking `std` stream and
/// runs `body` on a dedicated thread. Each accepted connection gets its
/// own receiver/donor-scanner task per `spec.md` §2's data flow.
///
/// # Safety note
/// `mio::net::TcpStream` on Unix owns the same file descriptor a
/// `std::net::TcpStream` would; converting via the raw fd and flipping
/// it back to blocking mode is the standard way to hand an accepted
/// connection off to a thread that wants ordinary blocking I/O
/// (`spec.md` §9 "Blocking-socket model").
fn spawn_blocking(
    stream: mio::net::TcpStream,
    body: impl FnOnce(std::net::TcpStream) + Send + 'static,
) {
    let std_stream = unsafe { std::net::TcpStream::from_raw_fd(stream.into_raw_fd()) };
    if let Err(e) = std_stream.set_nonblocking(false) {
        error!(error = %e, "failed to switch accepted socket to blocking mode");
        return;
    }
    std::thread::spawn(move || body(std_stream));
}
