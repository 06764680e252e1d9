//! Frame read/write of the fixed-layout replica wire header on a blocking
//! stream. See `spec.md` §4.A and §6 for the on-wire layout.

use std::io::{Read, Write};

use snafu::{ResultExt, Snafu};

/// Wire protocol version this build speaks. Any peer presenting a
/// different version is rejected before the rest of its header is read.
pub const REPLICA_VERSION: u16 = 1;

/// Fixed header size on the wire, little-endian, no implicit padding:
/// version(2) + opcode(1) + flags(1) + status(1) + pad(3) + io_seq(8)
/// + offset(8) + len(8) + checkpointed_io_seq(8) + meta_len(4) = 44.
pub const HEADER_SIZE: usize = 44;

/// Opcodes understood on the data and rebuild channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Handshake,
    Read,
    Write,
    Sync,
    RebuildStep,
    RebuildStepDone,
    RebuildComplete,
    Open,
}

impl Opcode {
    fn to_u8(self) -> u8 {
        match self {
            Opcode::Handshake => 0,
            Opcode::Read => 1,
            Opcode::Write => 2,
            Opcode::Sync => 3,
            Opcode::RebuildStep => 4,
            Opcode::RebuildStepDone => 5,
            Opcode::RebuildComplete => 6,
            Opcode::Open => 7,
        }
    }

    fn from_u8(v: u8) -> Result<Self, WireError> {
        Ok(match v {
            0 => Opcode::Handshake,
            1 => Opcode::Read,
            2 => Opcode::Write,
            3 => Opcode::Sync,
            4 => Opcode::RebuildStep,
            5 => Opcode::RebuildStepDone,
            6 => Opcode::RebuildComplete,
            7 => Opcode::Open,
            other => return Err(WireError::BadOpcode { opcode: other }),
        })
    }
}

/// Header flag bits (`spec.md` §6): `REBUILD` (0x01), `READ_METADATA`
/// (0x02); other bits are reserved and preserved verbatim round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u8);

impl Flags {
    pub const REBUILD: Flags = Flags(0x01);
    pub const READ_METADATA: Flags = Flags(0x02);

    pub const fn empty() -> Self {
        Flags(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u8) -> Self {
        Flags(bits)
    }

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// Reply status, meaningful on replies only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Failed,
}

impl Status {
    fn to_u8(self) -> u8 {
        match self {
            Status::Ok => 0,
            Status::Failed => 1,
        }
    }

    fn from_u8(v: u8) -> Status {
        if v == 0 {
            Status::Ok
        } else {
            Status::Failed
        }
    }
}

/// The fixed-layout header, decoded form.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub opcode: Opcode,
    pub flags: Flags,
    pub status: Status,
    /// Per-write monotonic sequence number; meaningful on write payloads
    /// and READ replies.
    pub io_seq: u64,
    pub offset: u64,
    /// Payload length in bytes following this header.
    pub len: u64,
    /// Recipient -> donor starting point on `REBUILD_STEP`.
    pub checkpointed_io_seq: u64,
    /// Length in bytes of the trailing metadata-descriptor array, if any.
    pub meta_len: u32,
}

impl Header {
    pub fn request(opcode: Opcode) -> Self {
        Self {
            opcode,
            flags: Flags::empty(),
            status: Status::Ok,
            io_seq: 0,
            offset: 0,
            len: 0,
            checkpointed_io_seq: 0,
            meta_len: 0,
        }
    }

    pub fn is_rebuild(&self) -> bool {
        self.flags.contains(Flags::REBUILD)
    }

    pub fn wants_metadata(&self) -> bool {
        self.flags.contains(Flags::READ_METADATA)
    }

    fn encode(&self, buf: &mut [u8; HEADER_SIZE]) {
        buf[0 .. 2].copy_from_slice(&REPLICA_VERSION.to_le_bytes());
        buf[2] = self.opcode.to_u8();
        buf[3] = self.flags.bits();
        buf[4] = self.status.to_u8();
        // buf[5..8] padding, left zeroed.
        buf[8 .. 16].copy_from_slice(&self.io_seq.to_le_bytes());
        buf[16 .. 24].copy_from_slice(&self.offset.to_le_bytes());
        buf[24 .. 32].copy_from_slice(&self.len.to_le_bytes());
        buf[32 .. 40].copy_from_slice(&self.checkpointed_io_seq.to_le_bytes());
        buf[40 .. 44].copy_from_slice(&self.meta_len.to_le_bytes());
    }

    fn decode_rest(buf: &[u8]) -> Result<Self, WireError> {
        let opcode = Opcode::from_u8(buf[0])?;
        let flags = Flags::from_bits_truncate(buf[1]);
        let status = Status::from_u8(buf[2]);
        let io_seq = u64::from_le_bytes(buf[6 .. 14].try_into().unwrap());
        let offset = u64::from_le_bytes(buf[14 .. 22].try_into().unwrap());
        let len = u64::from_le_bytes(buf[22 .. 30].try_into().unwrap());
        let checkpointed_io_seq =
            u64::from_le_bytes(buf[30 .. 38].try_into().unwrap());
        let meta_len = u32::from_le_bytes(buf[38 .. 42].try_into().unwrap());
        Ok(Self {
            opcode,
            flags,
            status,
            io_seq,
            offset,
            len,
            checkpointed_io_seq,
            meta_len,
        })
    }
}

/// Framing / transport failures from the codec. Any error here is a
/// signal for the caller to close the connection; there is no
/// partial-frame recovery (`spec.md` §4.A).
#[derive(Debug, Snafu)]
pub enum WireError {
    #[snafu(display(
        "peer speaks protocol version {got:#x}, expected {REPLICA_VERSION:#x}"
    ))]
    BadVersion { got: u16 },
    #[snafu(display("unrecognised opcode {opcode}"))]
    BadOpcode { opcode: u8 },
    #[snafu(display("peer closed the connection"))]
    PeerClosed,
    #[snafu(display("I/O error during {during}"))]
    Io {
        during: &'static str,
        source: std::io::Error,
    },
}

/// Reads exactly `buf.len()` bytes, retrying on `Interrupted`. A zero-byte
/// read (EOF before any bytes were consumed) is reported as
/// [`WireError::PeerClosed`]; EOF after a partial read is an I/O error.
pub fn read_exact<R: Read>(
    stream: &mut R,
    buf: &mut [u8],
) -> Result<(), WireError> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled ..]) {
            Ok(0) if filled == 0 => return Err(WireError::PeerClosed),
            Ok(0) => {
                return Err(WireError::Io {
                    during: "read_exact (short read)",
                    source: std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "peer closed mid-frame",
                    ),
                })
            },
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(WireError::Io {
                    during: "read_exact",
                    source: e,
                })
            },
        }
    }
    Ok(())
}

/// Writes the whole buffer, retrying on `Interrupted`.
pub fn write_exact<W: Write>(
    stream: &mut W,
    buf: &[u8],
) -> Result<(), WireError> {
    let mut written = 0;
    while written < buf.len() {
        match stream.write(&buf[written ..]) {
            Ok(0) => {
                return Err(WireError::Io {
                    during: "write_exact",
                    source: std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "wrote zero bytes",
                    ),
                })
            },
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(WireError::Io {
                    during: "write_exact",
                    source: e,
                })
            },
        }
    }
    Ok(())
}

/// Reads a header off the wire. The version prefix is read and checked
/// first; on mismatch the rest of the header is never consumed and
/// [`WireError::BadVersion`] is returned so the caller can close the
/// connection without misinterpreting trailing bytes as a new frame.
pub fn read_header<R: Read>(stream: &mut R) -> Result<Header, WireError> {
    let mut version_buf = [0u8; 2];
    read_exact(stream, &mut version_buf)?;
    let version = u16::from_le_bytes(version_buf);
    if version != REPLICA_VERSION {
        return Err(WireError::BadVersion { got: version });
    }

    let mut rest = [0u8; HEADER_SIZE - 2];
    read_exact(stream, &mut rest)?;
    Header::decode_rest(&rest)
}

/// Writes a header to the wire.
pub fn write_header<W: Write>(
    stream: &mut W,
    header: &Header,
) -> Result<(), WireError> {
    let mut buf = [0u8; HEADER_SIZE];
    header.encode(&mut buf);
    write_exact(stream, &buf).context(IoSnafu {
        during: "write_header",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trips_a_header() {
        let h = Header {
            opcode: Opcode::Write,
            flags: Flags::REBUILD,
            status: Status::Ok,
            io_seq: 42,
            offset: 4096,
            len: 24,
            checkpointed_io_seq: 7,
            meta_len: 0,
        };
        let mut buf = Vec::new();
        write_header(&mut buf, &h).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);

        let mut cur = Cursor::new(buf);
        let decoded = read_header(&mut cur).unwrap();
        assert_eq!(decoded.opcode, Opcode::Write);
        assert!(decoded.is_rebuild());
        assert_eq!(decoded.io_seq, 42);
        assert_eq!(decoded.offset, 4096);
        assert_eq!(decoded.len, 24);
        assert_eq!(decoded.checkpointed_io_seq, 7);
    }

    #[test]
    fn rejects_bad_version_without_consuming_rest() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0xDEADu16.to_le_bytes());
        buf.extend_from_slice(&[0xFFu8; HEADER_SIZE - 2]);
        let mut cur = Cursor::new(buf);
        let err = read_header(&mut cur).unwrap_err();
        assert_matches::assert_matches!(err, WireError::BadVersion { got } if got == 0xDEAD);
    }

    #[test]
    fn zero_byte_read_is_peer_closed() {
        let mut cur = Cursor::new(Vec::<u8>::new());
        let err = read_header(&mut cur).unwrap_err();
        assert_matches::assert_matches!(err, WireError::PeerClosed);
    }
}
