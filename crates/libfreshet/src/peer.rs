// One peer session: binds a three-socket connection to the
// clearing-house and runs six cooperative tasks, a sender and a receiver
// per socket. The first task to fail takes the whole session down; the
// cleanup path unregisters exactly once and fires the disconnect event
// exactly once.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace};

use freshet_core::server_info::ServerInfo;
use freshet_core::spawn_utils::spawn;
use wire_protocol::Message;

use crate::clearing_house::{ClearingHouse, Notice, PeerHandles};
use crate::connection::{Connection, ConnectionStreams, DEFAULT_MAX_DATA_FRAME_LEN};
use crate::error::Error;

#[derive(Debug, Clone, Copy)]
pub struct PeerOptions {
    /// Capacity of each outbound queue. Producers block when full.
    pub queue_capacity: usize,
    pub max_data_frame_len: usize,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            max_data_frame_len: DEFAULT_MAX_DATA_FRAME_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerState {
    Opening = 0,
    Running = 1,
    Draining = 2,
    Closed = 3,
}

pub struct Peer {
    remote: ServerInfo,
    // Weak: the clearing-house holds this peer's queue handles, the peer
    // must not keep the clearing-house alive in return.
    clearing_house: Weak<ClearingHouse>,
    state: AtomicU8,
    downloaded_bytes: AtomicU64,
    uploaded_bytes: AtomicU64,
}

impl Peer {
    pub fn new(remote: ServerInfo, clearing_house: &Arc<ClearingHouse>) -> Self {
        Peer {
            remote,
            clearing_house: Arc::downgrade(clearing_house),
            state: AtomicU8::new(PeerState::Opening as u8),
            downloaded_bytes: AtomicU64::new(0),
            uploaded_bytes: AtomicU64::new(0),
        }
    }

    pub fn remote(&self) -> ServerInfo {
        self.remote
    }

    pub fn state(&self) -> PeerState {
        match self.state.load(Ordering::Relaxed) {
            0 => PeerState::Opening,
            1 => PeerState::Running,
            2 => PeerState::Draining,
            _ => PeerState::Closed,
        }
    }

    fn set_state(&self, state: PeerState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes.load(Ordering::Relaxed)
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded_bytes.load(Ordering::Relaxed)
    }

    /// Drives the session to completion. Ok(()) is a clean drain; any
    /// error already tore the connection down.
    pub async fn run(
        &self,
        conn: Connection,
        options: PeerOptions,
        cancel: CancellationToken,
        disconnect_tx: broadcast::Sender<ServerInfo>,
    ) -> crate::Result<()> {
        let result = self.run_session(conn, options, &cancel).await;
        self.set_state(PeerState::Closed);
        // Stops any half of the session still blocked on I/O.
        cancel.cancel();
        debug!(
            downloaded = self.downloaded_bytes(),
            uploaded = self.uploaded_bytes(),
            "peer session over"
        );
        let _ = disconnect_tx.send(self.remote);
        result
    }

    async fn run_session(
        &self,
        conn: Connection,
        options: PeerOptions,
        cancel: &CancellationToken,
    ) -> crate::Result<()> {
        // A gone clearing-house means the node is already shutting down.
        let ch = self.clearing_house.upgrade().ok_or(Error::Cancelled)?;

        let (notice_tx, mut notice_rx) = tokio::sync::mpsc::channel(options.queue_capacity);
        let (request_tx, mut request_rx) = tokio::sync::mpsc::channel(options.queue_capacity);
        let (piece_tx, mut piece_rx) = tokio::sync::mpsc::channel(options.queue_capacity);
        // The clearing-house registration is the only holder of the queue
        // senders: unregistering closes all three queues at once.
        let session = ch.register(
            self.remote,
            PeerHandles {
                notices: notice_tx,
                requests: request_tx,
                pieces: piece_tx,
            },
        );

        let local_predicate = ch.local_predicate();
        let mut satisfied_rx = ch.subscribe_satisfied();
        let ConnectionStreams {
            mut notice_in,
            mut notice_out,
            mut request_in,
            mut request_out,
            mut data_in,
            mut data_out,
        } = conn.split(options.max_data_frame_len);

        self.set_state(PeerState::Running);

        let notice_sender = async {
            while let Some(notice) = notice_rx.recv().await {
                let msg = match notice {
                    Notice::File(info) => Message::FileNotice(info),
                    Notice::Piece(spec) => Message::PieceNotice(spec),
                    Notice::Removed(path) => Message::RemovedFileNotice(path),
                };
                notice_out.write_message(&msg).await?;
            }
            Ok::<_, Error>(())
        };

        let request_sender = async {
            // Prime the stream: the remote learns what we want before
            // anything else.
            request_out
                .write_message(&Message::Predicate(local_predicate))
                .await?;
            while let Some(spec) = request_rx.recv().await {
                request_out.write_message(&Message::Request(spec)).await?;
            }
            Ok::<_, Error>(())
        };

        let data_sender = async {
            while let Some(piece) = piece_rx.recv().await {
                let len = piece.data().len() as u64;
                data_out.write_message(&Message::Piece(piece)).await?;
                self.uploaded_bytes.fetch_add(len, Ordering::Relaxed);
            }
            Ok::<_, Error>(())
        };

        let notice_receiver = async {
            loop {
                let notice: Notice = match notice_in.read_message().await? {
                    Message::FileNotice(info) => Notice::File(info),
                    Message::PieceNotice(spec) => Notice::Piece(spec),
                    Message::RemovedFileNotice(path) => Notice::Removed(path),
                    other => {
                        return Err::<std::convert::Infallible, Error>(Error::UnexpectedMessage {
                            socket: "notice",
                            received: other.name(),
                        });
                    }
                };
                ch.process_notice(&self.remote, notice).await?;
            }
        };

        let request_receiver = async {
            loop {
                match request_in.read_message().await? {
                    // The first frame is the remote's predicate; later
                    // predicate frames are resubscriptions.
                    Message::Predicate(predicate) => {
                        ch.set_remote_predicate(&self.remote, predicate).await?
                    }
                    Message::Request(spec) => ch.process_request(&self.remote, spec).await?,
                    other => {
                        return Err::<std::convert::Infallible, Error>(Error::UnexpectedMessage {
                            socket: "request",
                            received: other.name(),
                        });
                    }
                }
            }
        };

        let data_receiver = async {
            loop {
                match data_in.read_message().await? {
                    Message::Piece(piece) => {
                        self.downloaded_bytes
                            .fetch_add(piece.data().len() as u64, Ordering::Relaxed);
                        ch.process_piece(&self.remote, piece).await?;
                    }
                    other => {
                        return Err::<std::convert::Infallible, Error>(Error::UnexpectedMessage {
                            socket: "data",
                            received: other.name(),
                        });
                    }
                }
            }
        };

        // Once the node's predicate is satisfied, unregister: that closes
        // the outbound queues, the senders flush what is left and finish,
        // and the select below exits through the senders branch.
        let drainer = async {
            if satisfied_rx.wait_for(|satisfied| *satisfied).await.is_ok() {
                self.set_state(PeerState::Draining);
                trace!("predicate satisfied, draining outbound queues");
                if let Some(ch) = self.clearing_house.upgrade() {
                    ch.unregister_session(&self.remote, session);
                }
            }
            std::future::pending::<()>().await
        };

        let senders = async {
            tokio::try_join!(notice_sender, request_sender, data_sender).map(|_| ())
        };
        let receivers = async {
            tokio::try_join!(notice_receiver, request_receiver, data_receiver).map(|_: (_, _, _)| ())
        };

        let result = tokio::select! {
            r = senders => r,
            r = receivers => r,
            _ = drainer => Err(Error::Cancelled),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        };
        if let Some(ch) = self.clearing_house.upgrade() {
            ch.unregister_session(&self.remote, session);
        }
        result
    }
}

/// Everything needed to launch a peer for a fresh connection, shared by
/// the accept loop and the outbound dialers.
#[derive(Clone)]
pub struct PeerSpawner {
    pub clearing_house: Arc<ClearingHouse>,
    pub options: PeerOptions,
    pub cancel: CancellationToken,
    pub disconnect_tx: broadcast::Sender<ServerInfo>,
}

impl PeerSpawner {
    pub fn spawn(&self, conn: Connection) {
        let remote = conn.remote();
        let peer = Peer::new(remote, &self.clearing_house);
        let options = self.options;
        let cancel = self.cancel.child_token();
        let disconnect_tx = self.disconnect_tx.clone();
        spawn(debug_span!("peer", %remote), async move {
            match peer.run(conn, options, cancel, disconnect_tx).await {
                Ok(()) => Ok(()),
                Err(Error::PeerDisconnected) => {
                    debug!("peer disconnected");
                    Ok(())
                }
                // Queues close when the session is being drained.
                Err(Error::QueueClosed) | Err(Error::Cancelled) => Ok(()),
                Err(e) => Err(e.into()),
            }
        });
    }
}
