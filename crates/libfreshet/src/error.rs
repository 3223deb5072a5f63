use freshet_core::file_info::ArchivePath;
use wire_protocol::{DeserializeError, SerializeError};

/// Peer-session level errors. Most of these tear down one connection and
/// surface as a disconnect event; none of them crash the node.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("error connecting over TCP: {0:#}")]
    Connect(#[source] std::io::Error),

    #[error("error writing: {0:#}")]
    Write(#[source] std::io::Error),

    #[error("error reading: {0:#}")]
    Read(#[source] std::io::Error),

    #[error("timeout {0}")]
    Timeout(&'static str),

    #[error("peer disconnected")]
    PeerDisconnected,

    #[error(transparent)]
    Deserialize(#[from] DeserializeError),

    #[error(transparent)]
    Serialize(#[from] SerializeError),

    #[error("unexpected {received} message on {socket} socket")]
    UnexpectedMessage {
        socket: &'static str,
        received: &'static str,
    },

    #[error("peer queue closed")]
    QueueClosed,

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("cancelled")]
    Cancelled,
}

/// Archive-level errors. BadPiece and UnknownFile are recoverable at the
/// clearing-house; Io is not.
#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error("i/o error: {0:#}")]
    Io(#[from] std::io::Error),

    #[error("unknown file {0}")]
    UnknownFile(ArchivePath),

    #[error("piece {path}#{index} not present")]
    PieceNotPresent { path: ArchivePath, index: u32 },

    #[error("bad piece {path}#{index}: {reason}")]
    BadPiece {
        path: ArchivePath,
        index: u32,
        reason: String,
    },
}

pub type Result<T> = core::result::Result<T, Error>;
