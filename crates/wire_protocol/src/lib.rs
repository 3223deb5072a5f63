// Wire codec for the freshet replication protocol.
//
// Every message is one frame: a big-endian u32 length covering everything
// after the length field, a one-byte type tag, then the tagged fields.
// Peer streams and the tracker stream share the framing and the field
// encodings; they use disjoint tag ranges.

pub mod framing;

use byteorder::{BE, ByteOrder};
use bytes::Bytes;

use freshet_core::bitset::FiniteBitSet;
use freshet_core::file_info::{ArchivePath, FileId, FileInfo, PathError};
use freshet_core::predicate::{AttrValue, Constraint, ConstraintOp, Filter, Predicate};
use freshet_core::server_info::ServerInfo;
use freshet_core::spec_set::{FilePieceSpecs, Piece, PieceSpec};

pub const FRAME_HEADER_LEN: usize = 4;

/// Upper bound for frames that carry no piece payload. Data frames are
/// bounded separately by the configured piece size.
pub const CONTROL_FRAME_MAX_LEN: usize = 1 << 20;

pub const PORT_HANDSHAKE_LEN: usize = 12;

type Tag = u8;

const TAG_FILE_NOTICE: Tag = 1;
const TAG_PIECE_NOTICE: Tag = 2;
const TAG_REMOVED_FILE_NOTICE: Tag = 3;
const TAG_REQUEST: Tag = 4;
const TAG_PREDICATE: Tag = 5;
const TAG_PIECE: Tag = 6;

const TAG_INQUISITOR: Tag = 16;
const TAG_PLUMBER: Tag = 17;
const TAG_SERVER_OFFLINE_REPORT: Tag = 18;

const OP_EQ: u8 = 0;
const OP_NE: u8 = 1;

const VALUE_TAG_STR: u8 = 0;
const VALUE_TAG_U64: u8 = 1;

const BITSET_PARTIAL: u8 = 0;
const BITSET_COMPLETE: u8 = 1;

#[derive(thiserror::Error, Debug)]
pub enum SerializeError {
    #[error("string of {0} bytes does not fit a u16 length")]
    StringTooLong(usize),
    #[error("{0} entries do not fit a u16 count")]
    TooManyEntries(usize),
}

#[derive(thiserror::Error, Debug)]
pub enum DeserializeError {
    #[error("not enough data: needed {needed} more bytes")]
    NotEnoughData { needed: usize },
    #[error("{remaining} trailing bytes after message")]
    TrailingBytes { remaining: usize },
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("string is not valid UTF-8")]
    BadUtf8,
    #[error(transparent)]
    InvalidPath(#[from] PathError),
    #[error("unknown constraint op {0}")]
    BadOp(u8),
    #[error("unknown attribute value tag {0}")]
    BadValueTag(u8),
    #[error("unknown bit-set state {0}")]
    BadBitSetState(u8),
    #[error("unknown IP family {0}")]
    BadIpFamily(u8),
    #[error("port {0} out of range")]
    PortOutOfRange(u32),
    #[error("inconsistent object: {0}")]
    Inconsistent(String),
}

/// Messages exchanged between peers. Which tags are legal on which socket
/// is enforced by the connection layer, not the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    FileNotice(FileInfo),
    PieceNotice(PieceSpec),
    RemovedFileNotice(ArchivePath),
    Request(PieceSpec),
    Predicate(Predicate),
    Piece(Piece),
}

/// Messages exchanged with the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerMessage {
    Inquisitor,
    Plumber(Vec<(ServerInfo, Predicate)>),
    ServerOfflineReport(ServerInfo),
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::FileNotice(_) => "file_notice",
            Message::PieceNotice(_) => "piece_notice",
            Message::RemovedFileNotice(_) => "removed_file_notice",
            Message::Request(_) => "request",
            Message::Predicate(_) => "predicate",
            Message::Piece(_) => "piece",
        }
    }

    /// Appends one full frame, length header included.
    pub fn serialize(&self, out: &mut Vec<u8>) -> Result<(), SerializeError> {
        frame(out, |out| match self {
            Message::FileNotice(info) => {
                out.push(TAG_FILE_NOTICE);
                write_file_info(out, info)
            }
            Message::PieceNotice(spec) => {
                out.push(TAG_PIECE_NOTICE);
                write_piece_spec(out, spec)
            }
            Message::RemovedFileNotice(path) => {
                out.push(TAG_REMOVED_FILE_NOTICE);
                write_string(out, path.as_str())
            }
            Message::Request(spec) => {
                out.push(TAG_REQUEST);
                write_piece_spec(out, spec)
            }
            Message::Predicate(predicate) => {
                out.push(TAG_PREDICATE);
                write_predicate(out, predicate)
            }
            Message::Piece(piece) => {
                out.push(TAG_PIECE);
                write_piece_spec(out, piece.spec())?;
                out.extend_from_slice(&(piece.data().len() as u32).to_be_bytes());
                out.extend_from_slice(piece.data());
                Ok(())
            }
        })
    }

    /// Parses one frame payload (everything after the length header).
    pub fn deserialize(frame: &[u8]) -> Result<Message, DeserializeError> {
        let mut r = Reader::new(frame);
        let msg = match r.u8()? {
            TAG_FILE_NOTICE => Message::FileNotice(read_file_info(&mut r)?),
            TAG_PIECE_NOTICE => Message::PieceNotice(read_piece_spec(&mut r)?),
            TAG_REMOVED_FILE_NOTICE => {
                Message::RemovedFileNotice(ArchivePath::new(r.string()?)?)
            }
            TAG_REQUEST => Message::Request(read_piece_spec(&mut r)?),
            TAG_PREDICATE => Message::Predicate(read_predicate(&mut r)?),
            TAG_PIECE => {
                let spec = read_piece_spec(&mut r)?;
                let len = r.u32()? as usize;
                let data = Bytes::copy_from_slice(r.take(len)?);
                let piece = Piece::new(spec, data)
                    .map_err(|e| DeserializeError::Inconsistent(format!("{e:#}")))?;
                Message::Piece(piece)
            }
            tag => return Err(DeserializeError::UnknownTag(tag)),
        };
        r.finish()?;
        Ok(msg)
    }
}

impl TrackerMessage {
    pub fn serialize(&self, out: &mut Vec<u8>) -> Result<(), SerializeError> {
        frame(out, |out| match self {
            TrackerMessage::Inquisitor => {
                out.push(TAG_INQUISITOR);
                Ok(())
            }
            TrackerMessage::Plumber(entries) => {
                out.push(TAG_PLUMBER);
                write_count(out, entries.len())?;
                for (server, predicate) in entries {
                    write_server_info(out, server);
                    write_predicate(out, predicate)?;
                }
                Ok(())
            }
            TrackerMessage::ServerOfflineReport(server) => {
                out.push(TAG_SERVER_OFFLINE_REPORT);
                write_server_info(out, server);
                Ok(())
            }
        })
    }

    pub fn deserialize(frame: &[u8]) -> Result<TrackerMessage, DeserializeError> {
        let mut r = Reader::new(frame);
        let msg = match r.u8()? {
            TAG_INQUISITOR => TrackerMessage::Inquisitor,
            TAG_PLUMBER => {
                let count = r.u16()? as usize;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let server = read_server_info(&mut r)?;
                    let predicate = read_predicate(&mut r)?;
                    entries.push((server, predicate));
                }
                TrackerMessage::Plumber(entries)
            }
            TAG_SERVER_OFFLINE_REPORT => {
                TrackerMessage::ServerOfflineReport(read_server_info(&mut r)?)
            }
            tag => return Err(DeserializeError::UnknownTag(tag)),
        };
        r.finish()?;
        Ok(msg)
    }
}

/// Piece completeness for one file, as persisted in archive sidecars.
pub fn encode_file_piece_specs(
    specs: &FilePieceSpecs,
    out: &mut Vec<u8>,
) -> Result<(), SerializeError> {
    write_file_info(out, specs.info())?;
    write_bitset(out, specs.bits());
    Ok(())
}

pub fn decode_file_piece_specs(buf: &[u8]) -> Result<FilePieceSpecs, DeserializeError> {
    let mut r = Reader::new(buf);
    let info = read_file_info(&mut r)?;
    let bits = read_bitset(&mut r)?;
    r.finish()?;
    FilePieceSpecs::from_parts(info, bits)
        .map_err(|e| DeserializeError::Inconsistent(format!("{e:#}")))
}

pub fn encode_port_handshake(ports: [u16; 3]) -> [u8; PORT_HANDSHAKE_LEN] {
    let mut out = [0u8; PORT_HANDSHAKE_LEN];
    for (i, port) in ports.iter().enumerate() {
        BE::write_u32(&mut out[i * 4..i * 4 + 4], *port as u32);
    }
    out
}

pub fn decode_port_handshake(buf: &[u8; PORT_HANDSHAKE_LEN]) -> Result<[u16; 3], DeserializeError> {
    let mut ports = [0u16; 3];
    for (i, port) in ports.iter_mut().enumerate() {
        let raw = BE::read_u32(&buf[i * 4..i * 4 + 4]);
        if raw > u16::MAX as u32 {
            return Err(DeserializeError::PortOutOfRange(raw));
        }
        *port = raw as u16;
    }
    Ok(ports)
}

fn frame(
    out: &mut Vec<u8>,
    body: impl FnOnce(&mut Vec<u8>) -> Result<(), SerializeError>,
) -> Result<(), SerializeError> {
    let start = out.len();
    out.extend_from_slice(&[0u8; FRAME_HEADER_LEN]);
    body(out)?;
    let frame_len = (out.len() - start - FRAME_HEADER_LEN) as u32;
    BE::write_u32(&mut out[start..start + FRAME_HEADER_LEN], frame_len);
    Ok(())
}

fn write_count(out: &mut Vec<u8>, count: usize) -> Result<(), SerializeError> {
    let count: u16 = count
        .try_into()
        .map_err(|_| SerializeError::TooManyEntries(count))?;
    out.extend_from_slice(&count.to_be_bytes());
    Ok(())
}

fn write_string(out: &mut Vec<u8>, s: &str) -> Result<(), SerializeError> {
    let len: u16 = s
        .len()
        .try_into()
        .map_err(|_| SerializeError::StringTooLong(s.len()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn write_file_info(out: &mut Vec<u8>, info: &FileInfo) -> Result<(), SerializeError> {
    write_string(out, info.path().as_str())?;
    out.extend_from_slice(&info.size().to_be_bytes());
    out.extend_from_slice(&info.default_piece_size().to_be_bytes());
    out.extend_from_slice(&info.ttl_seconds().to_be_bytes());
    Ok(())
}

fn write_piece_spec(out: &mut Vec<u8>, spec: &PieceSpec) -> Result<(), SerializeError> {
    write_file_info(out, spec.info())?;
    out.extend_from_slice(&spec.index().to_be_bytes());
    Ok(())
}

fn write_bitset(out: &mut Vec<u8>, bits: &FiniteBitSet) {
    out.extend_from_slice(&bits.size().to_be_bytes());
    if bits.all_set() {
        out.push(BITSET_COMPLETE);
    } else {
        out.push(BITSET_PARTIAL);
        out.extend_from_slice(bits.raw_bytes());
    }
}

fn write_predicate(out: &mut Vec<u8>, predicate: &Predicate) -> Result<(), SerializeError> {
    write_count(out, predicate.filters().len())?;
    for filter in predicate.filters() {
        write_count(out, filter.constraints().len())?;
        for constraint in filter.constraints() {
            write_string(out, constraint.name())?;
            out.push(match constraint.op() {
                ConstraintOp::Eq => OP_EQ,
                ConstraintOp::Ne => OP_NE,
            });
            match constraint.value() {
                AttrValue::Str(s) => {
                    out.push(VALUE_TAG_STR);
                    write_string(out, s)?;
                }
                AttrValue::U64(v) => {
                    out.push(VALUE_TAG_U64);
                    out.extend_from_slice(&v.to_be_bytes());
                }
            }
        }
    }
    Ok(())
}

fn write_server_info(out: &mut Vec<u8>, info: &ServerInfo) {
    match info.ip {
        std::net::IpAddr::V4(ip) => {
            out.push(4);
            out.extend_from_slice(&ip.octets());
        }
        std::net::IpAddr::V6(ip) => {
            out.push(6);
            out.extend_from_slice(&ip.octets());
        }
    }
    for port in info.ports {
        out.extend_from_slice(&(port as u32).to_be_bytes());
    }
}

fn read_file_info(r: &mut Reader<'_>) -> Result<FileInfo, DeserializeError> {
    let path = ArchivePath::new(r.string()?)?;
    let size = r.u64()?;
    let piece_size = r.u32()?;
    let ttl_seconds = r.u32()?;
    FileInfo::new(FileId::new(path), size, piece_size, ttl_seconds)
        .map_err(|e| DeserializeError::Inconsistent(format!("{e:#}")))
}

fn read_piece_spec(r: &mut Reader<'_>) -> Result<PieceSpec, DeserializeError> {
    let info = read_file_info(r)?;
    let index = r.u32()?;
    PieceSpec::new(info, index).map_err(|e| DeserializeError::Inconsistent(format!("{e:#}")))
}

fn read_bitset(r: &mut Reader<'_>) -> Result<FiniteBitSet, DeserializeError> {
    let size = r.u32()?;
    match r.u8()? {
        BITSET_COMPLETE => Ok(FiniteBitSet::complete(size)),
        BITSET_PARTIAL => {
            let bytes = r.take((size as usize).div_ceil(8))?;
            FiniteBitSet::from_raw_bytes(size, bytes)
                .map_err(|e| DeserializeError::Inconsistent(format!("{e:#}")))
        }
        state => Err(DeserializeError::BadBitSetState(state)),
    }
}

fn read_predicate(r: &mut Reader<'_>) -> Result<Predicate, DeserializeError> {
    let filter_count = r.u16()? as usize;
    let mut filters = Vec::with_capacity(filter_count);
    for _ in 0..filter_count {
        let constraint_count = r.u16()? as usize;
        let mut constraints = Vec::with_capacity(constraint_count);
        for _ in 0..constraint_count {
            let name = r.string()?;
            let op = match r.u8()? {
                OP_EQ => ConstraintOp::Eq,
                OP_NE => ConstraintOp::Ne,
                op => return Err(DeserializeError::BadOp(op)),
            };
            let value = match r.u8()? {
                VALUE_TAG_STR => AttrValue::Str(r.string()?),
                VALUE_TAG_U64 => AttrValue::U64(r.u64()?),
                tag => return Err(DeserializeError::BadValueTag(tag)),
            };
            constraints.push(Constraint::new(name, op, value));
        }
        filters.push(Filter::new(constraints));
    }
    Ok(Predicate::new(filters))
}

fn read_server_info(r: &mut Reader<'_>) -> Result<ServerInfo, DeserializeError> {
    let ip = match r.u8()? {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(r.take(4)?);
            std::net::IpAddr::from(octets)
        }
        6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(r.take(16)?);
            std::net::IpAddr::from(octets)
        }
        family => return Err(DeserializeError::BadIpFamily(family)),
    };
    let mut ports = [0u16; 3];
    for port in ports.iter_mut() {
        let raw = r.u32()?;
        if raw > u16::MAX as u32 {
            return Err(DeserializeError::PortOutOfRange(raw));
        }
        *port = raw as u16;
    }
    Ok(ServerInfo::new(ip, ports))
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DeserializeError> {
        if self.buf.len() < n {
            return Err(DeserializeError::NotEnoughData {
                needed: n - self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, DeserializeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DeserializeError> {
        Ok(BE::read_u16(self.take(2)?))
    }

    fn u32(&mut self) -> Result<u32, DeserializeError> {
        Ok(BE::read_u32(self.take(4)?))
    }

    fn u64(&mut self) -> Result<u64, DeserializeError> {
        Ok(BE::read_u64(self.take(8)?))
    }

    fn string(&mut self) -> Result<String, DeserializeError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DeserializeError::BadUtf8)
    }

    fn finish(self) -> Result<(), DeserializeError> {
        if !self.buf.is_empty() {
            return Err(DeserializeError::TrailingBytes {
                remaining: self.buf.len(),
            });
        }
        Ok(())
    }
}
