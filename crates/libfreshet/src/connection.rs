// A connection is three TCP sockets to the same remote, one per stream
// role. The dialer writes its own server's port triple on every socket
// right after connect; the acceptor uses that triple to group sockets
// back into connections (see server.rs).
//
// There is no protocol-level close. Dropping the halves closes the
// sockets, and the owning peer's cancellation token makes that happen on
// the first error anywhere in the session.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;
use tracing::trace;

use freshet_core::server_info::{ServerInfo, SocketRole};
use wire_protocol::framing::read_frame;
use wire_protocol::{CONTROL_FRAME_MAX_LEN, Message, encode_port_handshake};

use crate::error::Error;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Ceiling for data-socket frames: a piece payload plus its spec.
pub const DEFAULT_MAX_DATA_FRAME_LEN: usize = 16 << 20;

pub struct Connection {
    remote: ServerInfo,
    streams: [TcpStream; 3],
}

/// The six stream halves of one connection, framed and role-tagged.
pub struct ConnectionStreams {
    pub notice_in: FrameReader,
    pub notice_out: FrameWriter,
    pub request_in: FrameReader,
    pub request_out: FrameWriter,
    pub data_in: FrameReader,
    pub data_out: FrameWriter,
}

impl Connection {
    /// Dials all three sockets of a remote server in role order,
    /// identifying ourselves with the local port triple on each.
    pub async fn connect(
        remote: ServerInfo,
        local_ports: [u16; 3],
        connect_timeout: Duration,
    ) -> crate::Result<Connection> {
        let handshake = encode_port_handshake(local_ports);
        let mut streams = Vec::with_capacity(3);
        for role in SocketRole::ALL {
            let addr = remote.socket_addr(role);
            let mut stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(Error::Connect(e)),
                Err(_) => return Err(Error::Timeout("connecting to peer")),
            };
            let _ = stream.set_nodelay(true);
            stream
                .write_all(&handshake)
                .await
                .map_err(Error::Write)?;
            trace!(%remote, %role, "socket connected");
            streams.push(stream);
        }
        // Vec has exactly 3 elements.
        let streams: [TcpStream; 3] = streams.try_into().unwrap();
        Ok(Connection { remote, streams })
    }

    /// Builds a connection from three accepted sockets grouped by the
    /// server's accept loop, in role order.
    pub fn from_accepted(remote: ServerInfo, streams: [TcpStream; 3]) -> Connection {
        Connection { remote, streams }
    }

    pub fn remote(&self) -> ServerInfo {
        self.remote
    }

    pub fn split(self, max_data_frame_len: usize) -> ConnectionStreams {
        let [notice, request, data] = self.streams;
        let (notice_in, notice_out) = framed(notice, SocketRole::Notice, CONTROL_FRAME_MAX_LEN);
        let (request_in, request_out) = framed(request, SocketRole::Request, CONTROL_FRAME_MAX_LEN);
        let (data_in, data_out) = framed(data, SocketRole::Data, max_data_frame_len);
        ConnectionStreams {
            notice_in,
            notice_out,
            request_in,
            request_out,
            data_in,
            data_out,
        }
    }
}

fn framed(stream: TcpStream, role: SocketRole, max_frame_len: usize) -> (FrameReader, FrameWriter) {
    let (read, write) = stream.into_split();
    (
        FrameReader {
            read,
            role,
            max_frame_len,
            buf: Vec::new(),
        },
        FrameWriter {
            write,
            role,
            buf: Vec::new(),
        },
    )
}

pub struct FrameReader {
    read: OwnedReadHalf,
    role: SocketRole,
    max_frame_len: usize,
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn role(&self) -> SocketRole {
        self.role
    }

    /// Reads the next message. A clean EOF at a frame boundary surfaces
    /// as PeerDisconnected.
    pub async fn read_message(&mut self) -> crate::Result<Message> {
        let payload = read_frame(&mut self.read, &mut self.buf, self.max_frame_len)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => Error::PeerDisconnected,
                _ => Error::Read(e),
            })?;
        let msg = Message::deserialize(payload)?;
        trace!(role = %self.role, msg = msg.name(), "received");
        Ok(msg)
    }
}

pub struct FrameWriter {
    write: OwnedWriteHalf,
    role: SocketRole,
    buf: Vec<u8>,
}

impl FrameWriter {
    pub fn role(&self) -> SocketRole {
        self.role
    }

    pub async fn write_message(&mut self, msg: &Message) -> crate::Result<()> {
        self.buf.clear();
        msg.serialize(&mut self.buf)?;
        self.write
            .write_all(&self.buf)
            .await
            .map_err(Error::Write)?;
        trace!(role = %self.role, msg = msg.name(), "sent");
        Ok(())
    }
}
