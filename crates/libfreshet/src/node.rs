// A node is one participant: a local server, a clearing-house over the
// archive, and a pool of outbound clients fed by the tracker and any
// statically configured peers.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, warn};

use freshet_core::predicate::Predicate;
use freshet_core::server_info::ServerInfo;
use freshet_core::spawn_utils::{spawn, spawn_with_cancel};
use tracker_comms::TrackerClient;

use crate::archive::Archive;
use crate::clearing_house::ClearingHouse;
use crate::client::{Client, ConnectOptions};
use crate::peer::{PeerOptions, PeerSpawner};
use crate::server::{PortSpec, Server, ServerOptions};

/// A source serves until cancelled; a sink additionally stops on its own
/// once its predicate empties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Source,
    Sink,
}

#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub role: NodeRole,
    pub listen_ip: IpAddr,
    pub ports: PortSpec,
    pub tracker: Option<SocketAddr>,
    pub static_peers: Vec<ServerInfo>,
    pub server: ServerOptions,
    pub peer: PeerOptions,
    pub connect: ConnectOptions,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            role: NodeRole::Sink,
            listen_ip: IpAddr::from([127, 0, 0, 1]),
            ports: PortSpec::Ephemeral,
            tracker: None,
            static_peers: Vec::new(),
            server: ServerOptions::default(),
            peer: PeerOptions::default(),
            connect: ConnectOptions::default(),
        }
    }
}

/// Running node. Cancel it, or for a sink just wait: it finishes when
/// the predicate empties.
pub struct NodeHandle {
    server_info: ServerInfo,
    cancel: CancellationToken,
    disconnect_tx: broadcast::Sender<ServerInfo>,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl NodeHandle {
    pub fn server_info(&self) -> ServerInfo {
        self.server_info
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Disconnect events, one per closed peer session.
    pub fn subscribe_disconnects(&self) -> broadcast::Receiver<ServerInfo> {
        self.disconnect_tx.subscribe()
    }

    pub async fn wait(self) -> anyhow::Result<()> {
        self.task.await.context("node task panicked")?
    }
}

pub struct Node;

impl Node {
    /// Binds the server and starts everything. Binding errors surface
    /// here; replication errors surface through the returned handle.
    pub async fn start(
        archive: Arc<Archive>,
        predicate: Arc<RwLock<Predicate>>,
        options: NodeOptions,
    ) -> anyhow::Result<NodeHandle> {
        let server = Server::bind(options.listen_ip, options.ports, options.server)
            .await
            .context("error binding server")?;
        let server_info = server.server_info();

        let clearing_house = ClearingHouse::new(archive.clone(), predicate.clone());
        if options.role == NodeRole::Sink {
            // Files already complete locally satisfy their filters up
            // front; the archive emits no event for them.
            for info in archive.walk() {
                predicate.write().remove_if_possible(info.id());
            }
            clearing_house.flag_satisfied_if_empty();
        }

        let cancel = CancellationToken::new();
        let (disconnect_tx, _) = broadcast::channel(64);
        let spawner = PeerSpawner {
            clearing_house: clearing_house.clone(),
            options: options.peer,
            cancel: cancel.child_token(),
            disconnect_tx: disconnect_tx.clone(),
        };

        spawn_with_cancel(
            debug_span!("new_file_dispatch", server = %server_info),
            cancel.child_token(),
            clearing_house.clone().run_new_file_dispatch(),
        );
        spawn(
            debug_span!("accept_loop", server = %server_info),
            server.run_accept_loop(spawner.clone()),
        );

        let task = tokio::spawn(Self::run(
            server_info,
            clearing_house,
            spawner,
            options,
            cancel.clone(),
        ));

        Ok(NodeHandle {
            server_info,
            cancel,
            disconnect_tx,
            task,
        })
    }

    async fn run(
        server_info: ServerInfo,
        clearing_house: Arc<ClearingHouse>,
        spawner: PeerSpawner,
        options: NodeOptions,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let client = Client::new(server_info.ports, options.connect);

        let mut bootstrap: Vec<ServerInfo> = options.static_peers.clone();
        let tracker = options.tracker.map(TrackerClient::new);
        if let Some(tracker) = &tracker {
            match tracker.inquire().await {
                Ok(entries) => {
                    debug!(servers = entries.len(), "tracker bootstrap");
                    bootstrap.extend(entries.into_iter().map(|(server, _predicate)| server));
                }
                Err(e) => warn!("tracker inquiry failed, using static peers only: {e:#}"),
            }
        }
        bootstrap.sort();
        bootstrap.dedup();
        for remote in bootstrap {
            if remote == server_info {
                continue;
            }
            let spawner = spawner.clone();
            spawn_with_cancel(
                debug_span!("dialer", %remote),
                cancel.child_token(),
                async move {
                    let conn = client.connect_with_retry(remote).await?;
                    spawner.spawn(conn);
                    Ok(())
                },
            );
        }

        let mut satisfied_rx = clearing_house.subscribe_satisfied();
        match options.role {
            NodeRole::Source => cancel.cancelled().await,
            NodeRole::Sink => {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    r = satisfied_rx.wait_for(|satisfied| *satisfied) => {
                        if r.is_ok() {
                            info!("predicate satisfied, shutting down");
                        }
                    }
                }
            }
        }

        cancel.cancel();
        if let Some(tracker) = &tracker {
            if let Err(e) = tracker.report_offline(&server_info).await {
                debug!("error reporting offline to tracker: {e:#}");
            }
        }
        Ok(())
    }
}
