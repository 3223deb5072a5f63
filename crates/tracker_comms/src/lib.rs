// Tracker proxy: one short-lived TCP connection per exchange.
//
// The tracker is an external collaborator. All this crate needs from it
// is that the reply to an Inquisitor is a Plumber mapping each known
// server to the predicate it is interested in.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use freshet_core::predicate::Predicate;
use freshet_core::server_info::ServerInfo;
use wire_protocol::framing::read_frame;
use wire_protocol::{CONTROL_FRAME_MAX_LEN, TrackerMessage};

pub const DEFAULT_TRACKER_TIMEOUT: Duration = Duration::from_secs(10);

async fn with_timeout<T, E>(
    name: &'static str,
    timeout_value: Duration,
    fut: impl std::future::Future<Output = Result<T, E>>,
) -> anyhow::Result<T>
where
    E: Into<anyhow::Error>,
{
    match timeout(timeout_value, fut).await {
        Ok(v) => v.map_err(Into::into),
        Err(_) => anyhow::bail!("timeout {name} at {timeout_value:?}"),
    }
}

#[derive(Debug, Clone)]
pub struct TrackerClient {
    addr: SocketAddr,
    timeout: Duration,
}

impl TrackerClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self::with_timeout_value(addr, DEFAULT_TRACKER_TIMEOUT)
    }

    pub fn with_timeout_value(addr: SocketAddr, timeout: Duration) -> Self {
        TrackerClient { addr, timeout }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn connect(&self) -> anyhow::Result<TcpStream> {
        with_timeout("connecting to tracker", self.timeout, TcpStream::connect(self.addr))
            .await
            .with_context(|| format!("error connecting to tracker {}", self.addr))
    }

    async fn send(&self, stream: &mut TcpStream, msg: &TrackerMessage) -> anyhow::Result<()> {
        let mut buf = Vec::new();
        msg.serialize(&mut buf)
            .context("error serializing tracker message")?;
        with_timeout("writing to tracker", self.timeout, stream.write_all(&buf)).await
    }

    /// Asks for the current server-to-predicate map.
    pub async fn inquire(&self) -> anyhow::Result<Vec<(ServerInfo, Predicate)>> {
        let mut stream = self.connect().await?;
        self.send(&mut stream, &TrackerMessage::Inquisitor).await?;

        let mut buf = Vec::new();
        let payload = with_timeout(
            "reading tracker reply",
            self.timeout,
            read_frame(&mut stream, &mut buf, CONTROL_FRAME_MAX_LEN),
        )
        .await
        .context("error reading tracker reply")?;

        match TrackerMessage::deserialize(payload)? {
            TrackerMessage::Plumber(entries) => {
                debug!(servers = entries.len(), "tracker returned server list");
                trace!(?entries);
                Ok(entries)
            }
            other => anyhow::bail!("unexpected tracker reply {other:?}"),
        }
    }

    /// Tells the tracker a server went away. Fire and forget, no reply.
    pub async fn report_offline(&self, server: &ServerInfo) -> anyhow::Result<()> {
        let mut stream = self.connect().await?;
        self.send(
            &mut stream,
            &TrackerMessage::ServerOfflineReport(*server),
        )
        .await?;
        stream
            .shutdown()
            .await
            .context("error closing tracker connection")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// A single-shot in-process tracker speaking the real wire protocol.
    async fn run_fake_tracker(
        listener: TcpListener,
        reply: Option<TrackerMessage>,
    ) -> anyhow::Result<TrackerMessage> {
        let (mut stream, _) = listener.accept().await?;
        let mut buf = Vec::new();
        let payload = read_frame(&mut stream, &mut buf, CONTROL_FRAME_MAX_LEN).await?;
        let received = TrackerMessage::deserialize(payload)?;
        if let Some(reply) = reply {
            let mut out = Vec::new();
            reply.serialize(&mut out)?;
            stream.write_all(&out).await?;
        }
        Ok(received)
    }

    #[tokio::test]
    async fn test_inquire_returns_plumber_entries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = ServerInfo::new("127.0.0.1".parse().unwrap(), [5000, 5001, 5002]);
        let reply = TrackerMessage::Plumber(vec![(server, Predicate::everything())]);
        let tracker = tokio::spawn(run_fake_tracker(listener, Some(reply)));

        let entries = TrackerClient::new(addr).inquire().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, server);
        assert_eq!(entries[0].1, Predicate::everything());

        let received = tracker.await.unwrap().unwrap();
        assert_eq!(received, TrackerMessage::Inquisitor);
    }

    #[tokio::test]
    async fn test_report_offline_sends_and_expects_no_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let tracker = tokio::spawn(run_fake_tracker(listener, None));

        let server = ServerInfo::new("127.0.0.1".parse().unwrap(), [1, 2, 3]);
        TrackerClient::new(addr)
            .report_offline(&server)
            .await
            .unwrap();

        let received = tracker.await.unwrap().unwrap();
        assert_eq!(received, TrackerMessage::ServerOfflineReport(server));
    }

    #[tokio::test]
    async fn test_inquire_fails_fast_when_tracker_is_down() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = TrackerClient::with_timeout_value(addr, Duration::from_secs(2));
        assert!(client.inquire().await.is_err());
    }
}
