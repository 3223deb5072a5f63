// Listens on a port triple and reassembles triples of incoming sockets
// into connections. Sockets are grouped by (remote IP, the port triple
// the remote wrote in its handshake); the first complete triple wins and
// stragglers are swept out after a timeout.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use anyhow::Context;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, timeout};
use tracing::{debug, trace, warn};

use freshet_core::server_info::{ServerInfo, SocketRole};
use wire_protocol::{PORT_HANDSHAKE_LEN, decode_port_handshake};

use crate::connection::Connection;
use crate::peer::PeerSpawner;

/// How a server picks its three ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSpec {
    /// Exactly these three ports.
    Explicit([u16; 3]),
    /// A contiguous triple starting at the base.
    Range(u16),
    /// Three ephemeral ports.
    Ephemeral,
}

#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    /// How long an accepted socket may take to deliver its 12-byte
    /// handshake.
    pub handshake_timeout: Duration,
    /// How long an incomplete socket triple may linger.
    pub pending_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            pending_timeout: Duration::from_secs(10),
        }
    }
}

pub struct Server {
    listeners: [TcpListener; 3],
    info: ServerInfo,
    options: ServerOptions,
}

struct PendingConnection {
    streams: [Option<TcpStream>; 3],
    deadline: Instant,
}

impl PendingConnection {
    fn is_complete(&self) -> bool {
        self.streams.iter().all(|s| s.is_some())
    }
}

impl Server {
    pub async fn bind(ip: IpAddr, spec: PortSpec, options: ServerOptions) -> anyhow::Result<Server> {
        let ports: [u16; 3] = match spec {
            PortSpec::Explicit(ports) => ports,
            PortSpec::Range(base) => {
                let end = base
                    .checked_add(2)
                    .with_context(|| format!("port range starting at {base} overflows"))?;
                [base, base + 1, end]
            }
            PortSpec::Ephemeral => [0, 0, 0],
        };
        let mut listeners = Vec::with_capacity(3);
        let mut bound = [0u16; 3];
        for (i, port) in ports.into_iter().enumerate() {
            let listener = TcpListener::bind((ip, port))
                .await
                .with_context(|| format!("error binding {} socket to {ip}:{port}", SocketRole::ALL[i]))?;
            bound[i] = listener.local_addr()?.port();
            listeners.push(listener);
        }
        // Vec has exactly 3 elements.
        let listeners: [TcpListener; 3] = listeners.try_into().unwrap();
        let info = ServerInfo::new(ip, bound);
        debug!(server = %info, "listening");
        Ok(Server {
            listeners,
            info,
            options,
        })
    }

    pub fn server_info(&self) -> ServerInfo {
        self.info
    }

    /// Accepts until cancelled (via the spawner's token). Every complete
    /// socket triple turns into a peer.
    pub async fn run_accept_loop(self, spawner: PeerSpawner) -> anyhow::Result<()> {
        let mut pending: HashMap<ServerInfo, PendingConnection> = HashMap::new();
        let mut sweep = tokio::time::interval(Duration::from_secs(2));
        let [notice_listener, request_listener, data_listener] = &self.listeners;
        loop {
            let (role, accepted) = tokio::select! {
                _ = spawner.cancel.cancelled() => return Ok(()),
                r = notice_listener.accept() => (SocketRole::Notice, r),
                r = request_listener.accept() => (SocketRole::Request, r),
                r = data_listener.accept() => (SocketRole::Data, r),
                _ = sweep.tick() => {
                    let now = Instant::now();
                    pending.retain(|remote, p| {
                        let keep = p.deadline > now;
                        if !keep {
                            debug!(%remote, "dropping incomplete connection");
                        }
                        keep
                    });
                    continue;
                }
            };
            let (stream, addr) = match accepted {
                Ok(v) => v,
                Err(e) => {
                    warn!(%role, "accept error: {e:#}");
                    continue;
                }
            };
            match self.read_handshake(stream, addr.ip()).await {
                Ok((remote, stream)) => {
                    self.file_socket(&mut pending, &spawner, remote, role, stream)
                }
                Err(e) => debug!(%role, %addr, "dropping socket without handshake: {e:#}"),
            }
        }
    }

    async fn read_handshake(
        &self,
        mut stream: TcpStream,
        ip: IpAddr,
    ) -> anyhow::Result<(ServerInfo, TcpStream)> {
        let mut buf = [0u8; PORT_HANDSHAKE_LEN];
        timeout(self.options.handshake_timeout, stream.read_exact(&mut buf))
            .await
            .context("timed out reading port handshake")?
            .context("error reading port handshake")?;
        let ports = decode_port_handshake(&buf)?;
        let _ = stream.set_nodelay(true);
        Ok((ServerInfo::new(ip, ports), stream))
    }

    fn file_socket(
        &self,
        pending: &mut HashMap<ServerInfo, PendingConnection>,
        spawner: &PeerSpawner,
        remote: ServerInfo,
        role: SocketRole,
        stream: TcpStream,
    ) {
        let entry = pending
            .entry(remote)
            .or_insert_with(|| PendingConnection {
                streams: [None, None, None],
                deadline: Instant::now() + self.options.pending_timeout,
            });
        let slot = &mut entry.streams[role.index()];
        if slot.is_some() {
            // First triple wins; a duplicate role is a stray dial.
            debug!(%remote, %role, "dropping duplicate socket");
            return;
        }
        *slot = Some(stream);
        trace!(%remote, %role, "socket filed");
        if entry.is_complete() {
            let entry = pending.remove(&remote).unwrap();
            let streams = entry.streams.map(|s| s.unwrap());
            debug!(%remote, "connection complete, starting peer");
            spawner.spawn(Connection::from_accepted(remote, streams));
        }
    }
}
