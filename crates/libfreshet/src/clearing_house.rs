// Per-node mediator between the archive and every connected peer.
//
// Lock discipline: the peer map lock and the predicate lock are never
// held across queue sends or archive I/O. Handles are cloned out under
// the lock, the lock is dropped, then the slow work happens.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, trace, warn};

use freshet_core::file_info::{ArchivePath, FileInfo};
use freshet_core::predicate::Predicate;
use freshet_core::server_info::ServerInfo;
use freshet_core::spec_set::{Piece, PieceSpec};

use crate::archive::{Archive, PutPieceOutcome};
use crate::error::ArchiveError;
use crate::spawn_utils::BlockingSpawner;

/// Advertisement delivered on the notice stream.
#[derive(Debug, Clone)]
pub enum Notice {
    File(FileInfo),
    Piece(PieceSpec),
    Removed(ArchivePath),
}

/// Senders feeding one peer's three outbound streams. Bounded: a slow
/// socket back-pressures into whoever produces work for it.
#[derive(Clone)]
pub struct PeerHandles {
    pub notices: mpsc::Sender<Notice>,
    pub requests: mpsc::Sender<PieceSpec>,
    pub pieces: mpsc::Sender<Piece>,
}

struct RegisteredPeer {
    session: u64,
    handles: PeerHandles,
    remote_predicate: Option<Predicate>,
}

pub struct ClearingHouse {
    archive: Arc<Archive>,
    predicate: Arc<RwLock<Predicate>>,
    peers: Mutex<HashMap<ServerInfo, RegisteredPeer>>,
    satisfied_tx: watch::Sender<bool>,
    // Subscribed at construction so completions cannot slip past before
    // the dispatch task gets scheduled.
    new_file_events: Mutex<Option<broadcast::Receiver<FileInfo>>>,
    next_session: AtomicU64,
    spawner: BlockingSpawner,
}

impl ClearingHouse {
    pub fn new(archive: Arc<Archive>, predicate: Arc<RwLock<Predicate>>) -> Arc<Self> {
        let (satisfied_tx, _) = watch::channel(false);
        let new_file_events = Mutex::new(Some(archive.subscribe()));
        Arc::new(ClearingHouse {
            archive,
            predicate,
            peers: Mutex::new(HashMap::new()),
            satisfied_tx,
            new_file_events,
            next_session: AtomicU64::new(0),
            spawner: BlockingSpawner::default(),
        })
    }

    pub fn archive(&self) -> &Arc<Archive> {
        &self.archive
    }

    /// Snapshot of the node's own predicate, sent to prime each request
    /// stream.
    pub fn local_predicate(&self) -> Predicate {
        self.predicate.read().clone()
    }

    /// Flips true once the local predicate empties out.
    pub fn subscribe_satisfied(&self) -> watch::Receiver<bool> {
        self.satisfied_tx.subscribe()
    }

    /// A sink configured with an already-empty predicate wants nothing;
    /// flag it satisfied up front.
    pub fn flag_satisfied_if_empty(&self) {
        if self.predicate.read().is_empty() {
            self.satisfied_tx.send_replace(true);
        }
    }

    /// Registers a peer session, returning the id that scopes later
    /// unregistration to exactly this session. The id deliberately is
    /// not a channel clone: once the registration drops, all three queue
    /// senders are gone and the peer's sender tasks see closure.
    pub fn register(&self, peer: ServerInfo, handles: PeerHandles) -> u64 {
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        debug!(%peer, session, "registering peer");
        self.peers.lock().insert(
            peer,
            RegisteredPeer {
                session,
                handles,
                remote_predicate: None,
            },
        );
        session
    }

    pub fn unregister(&self, peer: &ServerInfo) {
        if self.peers.lock().remove(peer).is_some() {
            debug!(%peer, "unregistered peer");
        }
    }

    /// Unregisters only if `session` still identifies the registered
    /// session. A reconnect may already have replaced the registration;
    /// the old session must not tear the new one down.
    pub fn unregister_session(&self, peer: &ServerInfo, session: u64) {
        let mut peers = self.peers.lock();
        if peers.get(peer).is_some_and(|p| p.session == session) {
            peers.remove(peer);
            debug!(%peer, session, "unregistered peer");
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Stores the predicate the remote primed its request stream with,
    /// then advertises every complete file it matches.
    pub async fn set_remote_predicate(
        &self,
        peer: &ServerInfo,
        predicate: Predicate,
    ) -> crate::Result<()> {
        let notices = {
            let mut peers = self.peers.lock();
            let Some(registered) = peers.get_mut(peer) else {
                return Ok(());
            };
            registered.remote_predicate = Some(predicate.clone());
            registered.handles.notices.clone()
        };
        let matching: Vec<FileInfo> = self
            .archive
            .walk()
            .into_iter()
            .filter(|info| predicate.satisfied_by(info.id()))
            .collect();
        debug!(%peer, files = matching.len(), "remote predicate set");
        for info in matching {
            notices
                .send(Notice::File(info))
                .await
                .map_err(|_| crate::Error::QueueClosed)?;
        }
        Ok(())
    }

    /// Handles a notice from a peer: anything the local predicate wants
    /// and the archive lacks turns into requests on that peer's request
    /// stream. Idempotent against duplicate notices.
    pub async fn process_notice(&self, from: &ServerInfo, notice: Notice) -> crate::Result<()> {
        match notice {
            Notice::File(info) => {
                if !self.predicate.read().satisfied_by(info.id()) {
                    trace!(%from, path = %info.path(), "file notice does not match predicate");
                    return Ok(());
                }
                self.spawner
                    .run_blocking(|| self.archive.add_file(info.clone()))?;
                let missing = self.archive.missing_pieces(info.path())?;
                let Some(requests) = self.request_sender(from) else {
                    return Ok(());
                };
                for spec in missing.iter() {
                    requests
                        .send(spec)
                        .await
                        .map_err(|_| crate::Error::QueueClosed)?;
                }
                Ok(())
            }
            Notice::Piece(spec) => {
                if !self.predicate.read().satisfied_by(spec.info().id()) {
                    return Ok(());
                }
                self.spawner
                    .run_blocking(|| self.archive.add_file(spec.info().clone()))?;
                if self.archive.has_piece(&spec) {
                    return Ok(());
                }
                let Some(requests) = self.request_sender(from) else {
                    return Ok(());
                };
                requests
                    .send(spec)
                    .await
                    .map_err(|_| crate::Error::QueueClosed)?;
                Ok(())
            }
            Notice::Removed(path) => {
                match self.spawner.run_blocking(|| self.archive.remove_file(&path)) {
                    Ok(removed) => {
                        if removed {
                            debug!(%from, %path, "file removed on remote notice");
                        }
                    }
                    Err(e) => warn!(%from, %path, "error removing file: {e:#}"),
                }
                Ok(())
            }
        }
    }

    /// Handles a piece request: read from the archive onto the peer's
    /// data stream. Requests for unknown files or absent pieces are
    /// ignored silently.
    pub async fn process_request(&self, from: &ServerInfo, spec: PieceSpec) -> crate::Result<()> {
        let piece = match self.spawner.run_blocking(|| self.archive.get_piece(&spec)) {
            Ok(piece) => piece,
            Err(ArchiveError::UnknownFile(_)) | Err(ArchiveError::PieceNotPresent { .. }) => {
                trace!(%from, %spec, "ignoring request for data we do not have");
                return Ok(());
            }
            Err(e @ ArchiveError::BadPiece { .. }) => {
                warn!(%from, %spec, "ignoring inconsistent request: {e:#}");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let Some(pieces) = self.piece_sender(from) else {
            return Ok(());
        };
        pieces
            .send(piece)
            .await
            .map_err(|_| crate::Error::QueueClosed)?;
        Ok(())
    }

    /// Handles an arriving piece: store it, then relay a piece notice to
    /// every other interested peer. Data the local predicate never asked
    /// for is stored anyway (storage is idempotent) but not relayed.
    pub async fn process_piece(&self, from: &ServerInfo, piece: Piece) -> crate::Result<()> {
        let spec = piece.spec().clone();
        let wanted = self.predicate.read().satisfied_by(spec.info().id());
        let outcome = match self.spawner.run_blocking(|| self.archive.put_piece(&piece)) {
            Ok(outcome) => outcome,
            Err(e @ ArchiveError::BadPiece { .. }) => {
                warn!(%from, %spec, "dropping bad piece: {e:#}");
                return Ok(());
            }
            Err(ArchiveError::UnknownFile(_)) => {
                // The file notice may not have been processed yet (streams
                // are unordered); register and retry once.
                self.spawner
                    .run_blocking(|| self.archive.add_file(spec.info().clone()))?;
                self.spawner.run_blocking(|| self.archive.put_piece(&piece))?
            }
            Err(e) => return Err(e.into()),
        };
        if !matches!(outcome, PutPieceOutcome::Stored { .. }) {
            return Ok(());
        }
        if !wanted {
            trace!(%from, %spec, "stored unsolicited piece without relaying");
            return Ok(());
        }
        // Completion fan-out (file notices, predicate removal) rides on
        // the archive's new-file event, see run_new_file_dispatch.
        for (peer, notices) in self.interested_peers(spec.info(), Some(from)) {
            if notices.send(Notice::Piece(spec.clone())).await.is_err() {
                trace!(%peer, "peer queue closed while relaying piece notice");
            }
        }
        Ok(())
    }

    /// Drops a file locally and tells every connected peer it is gone.
    pub async fn remove_and_announce(&self, path: &ArchivePath) -> crate::Result<()> {
        self.spawner.run_blocking(|| self.archive.remove_file(path))?;
        let peers: Vec<_> = self
            .peers
            .lock()
            .values()
            .map(|p| p.handles.notices.clone())
            .collect();
        for notices in peers {
            if notices.send(Notice::Removed(path.clone())).await.is_err() {
                trace!("peer queue closed while announcing removal");
            }
        }
        Ok(())
    }

    /// Dispatch loop for new-file events: drops satisfied filters from
    /// the local predicate and advertises the file to interested peers.
    /// Runs for the node's lifetime.
    pub async fn run_new_file_dispatch(self: Arc<Self>) -> anyhow::Result<()> {
        let mut events = self
            .new_file_events
            .lock()
            .take()
            .context("new-file dispatch is already running")?;
        loop {
            let info = match events.recv().await {
                Ok(info) => info,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "new-file dispatch lagged behind archive events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            };
            let removed = self.predicate.write().remove_if_possible(info.id());
            if removed && self.predicate.read().is_empty() {
                debug!("predicate is empty, node is satisfied");
                self.satisfied_tx.send_replace(true);
            }
            for (peer, notices) in self.interested_peers(&info, None) {
                trace!(%peer, path = %info.path(), "advertising complete file");
                if notices.send(Notice::File(info.clone())).await.is_err() {
                    trace!(%peer, "peer queue closed while advertising file");
                }
            }
        }
    }

    fn request_sender(&self, peer: &ServerInfo) -> Option<mpsc::Sender<PieceSpec>> {
        self.peers
            .lock()
            .get(peer)
            .map(|p| p.handles.requests.clone())
    }

    fn piece_sender(&self, peer: &ServerInfo) -> Option<mpsc::Sender<Piece>> {
        self.peers.lock().get(peer).map(|p| p.handles.pieces.clone())
    }

    /// Notice senders of every registered peer whose predicate matches
    /// the file, except `exclude`.
    fn interested_peers(
        &self,
        info: &FileInfo,
        exclude: Option<&ServerInfo>,
    ) -> Vec<(ServerInfo, mpsc::Sender<Notice>)> {
        self.peers
            .lock()
            .iter()
            .filter(|(peer, _)| Some(**peer) != exclude.copied())
            .filter(|(_, p)| {
                p.remote_predicate
                    .as_ref()
                    .is_some_and(|pred| pred.satisfied_by(info.id()))
            })
            .map(|(peer, p)| (*peer, p.handles.notices.clone()))
            .collect()
    }
}
