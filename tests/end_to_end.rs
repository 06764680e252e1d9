//! End-to-end exercise of the wire codec, worker dispatch and connection
//! lifecycle over a real loopback TCP connection, covering the literal
//! scenarios in `spec.md` §8 (1: single write and read; 2: version
//! mismatch). Gated behind `test-support` (`Cargo.toml`'s `[[test]]`
//! entry) so `FakeVolumeStore` is available outside the library's own
//! unit tests, the way `io-engine-tests` backs the teacher crate's
//! integration suite.

use std::{
    io::{Read, Write},
    net::TcpStream,
    sync::Arc,
    time::Duration,
};

use replica_engine::{
    config::ReplicaEngineConfig,
    engine::ReplicaEngine,
    store::VolumeStore,
    test_support::FakeVolumeStore,
    volume::{VolumeInfo, VolumeState},
    wire::{self, Flags, Header, Opcode, Status, HEADER_SIZE, REPLICA_VERSION},
};

fn start_engine(io_port: u16, rebuild_port: u16) -> ReplicaEngine {
    let config = ReplicaEngineConfig {
        io_port,
        rebuild_port,
        worker_threads: 2,
        ..ReplicaEngineConfig::default()
    };
    let store: Arc<dyn VolumeStore> = Arc::new(FakeVolumeStore::new(1 << 20));
    let engine = ReplicaEngine::start(config, store).expect("engine should start");
    // Give the acceptor a moment to register both listeners before the
    // test dials in.
    std::thread::sleep(Duration::from_millis(50));
    engine
}

fn send_handshake(stream: &mut TcpStream, name: &str) {
    let mut header = Header::request(Opcode::Handshake);
    header.len = name.len() as u64;
    wire::write_header(stream, &header).unwrap();
    wire::write_exact(stream, name.as_bytes()).unwrap();
}

#[test]
fn single_write_then_read_round_trips_data_and_metadata() {
    let io_port = 18_410;
    let rebuild_port = 18_411;
    let mut engine = start_engine(io_port, rebuild_port);

    let volume = VolumeInfo::new("v1", 0);
    volume.mark_online();
    engine.registry().insert(volume.clone());

    let mut stream = TcpStream::connect(("127.0.0.1", io_port)).expect("connect to io port");
    send_handshake(&mut stream, "v1");

    // WRITE: one record {io_num=7, data="ABCDEFGH"} at offset 0.
    let mut payload = Vec::new();
    payload.extend_from_slice(&7u64.to_le_bytes());
    payload.extend_from_slice(&8u64.to_le_bytes());
    payload.extend_from_slice(b"ABCDEFGH");
    let mut write_header = Header::request(Opcode::Write);
    write_header.offset = 0;
    write_header.len = payload.len() as u64;
    wire::write_header(&mut stream, &write_header).unwrap();
    wire::write_exact(&mut stream, &payload).unwrap();

    let write_reply = wire::read_header(&mut stream).expect("write reply header");
    assert_eq!(write_reply.status, Status::Ok);
    assert_eq!(write_reply.len, 0);

    // READ: offset 0, len 8, with metadata requested.
    let mut read_header = Header::request(Opcode::Read);
    read_header.offset = 0;
    read_header.len = 8;
    read_header.flags = Flags::READ_METADATA;
    wire::write_header(&mut stream, &read_header).unwrap();

    let read_reply = wire::read_header(&mut stream).expect("read reply header");
    assert_eq!(read_reply.status, Status::Ok);
    assert_eq!(read_reply.len, 8);

    let mut data = [0u8; 8];
    wire::read_exact(&mut stream, &mut data).unwrap();
    assert_eq!(&data, b"ABCDEFGH");

    assert_eq!(read_reply.meta_len, 24);
    let mut meta = [0u8; 24];
    wire::read_exact(&mut stream, &mut meta).unwrap();
    let offset = u64::from_le_bytes(meta[0 .. 8].try_into().unwrap());
    let len = u64::from_le_bytes(meta[8 .. 16].try_into().unwrap());
    let io_num = u64::from_le_bytes(meta[16 .. 24].try_into().unwrap());
    assert_eq!((offset, len, io_num), (0, 8, 7));

    assert_eq!(volume.running_ionum(), 7);

    drop(stream);
    engine.shutdown();
    engine.join().expect("engine should shut down cleanly");
}

#[test]
fn version_mismatch_closes_the_connection_without_touching_volume_state() {
    let io_port = 18_412;
    let rebuild_port = 18_413;
    let mut engine = start_engine(io_port, rebuild_port);

    let volume = VolumeInfo::new("v1", 0);
    volume.mark_online();
    engine.registry().insert(volume.clone());

    let mut stream = TcpStream::connect(("127.0.0.1", io_port)).expect("connect to io port");

    let mut bad_frame = Vec::with_capacity(HEADER_SIZE);
    bad_frame.extend_from_slice(&0xDEADu16.to_le_bytes());
    assert_ne!(0xDEADu16, REPLICA_VERSION);
    bad_frame.extend_from_slice(&[0xFFu8; HEADER_SIZE - 2]);
    stream.write_all(&bad_frame).unwrap();

    // The receiver closes the socket on the bad version without reading
    // any more bytes; the next read from our side observes EOF.
    let mut buf = [0u8; 1];
    let n = stream.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "server should have closed the connection");

    assert_eq!(volume.state(), VolumeState::Online);
    assert_eq!(volume.refcount(), 0);

    engine.shutdown();
    engine.join().expect("engine should shut down cleanly");
}
