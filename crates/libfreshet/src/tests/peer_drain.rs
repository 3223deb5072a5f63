// Exercises the autonomous drain path: a peer whose node predicate
// becomes satisfied must close its session through its own sender tasks,
// with no node-level cancellation involved.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use freshet_core::file_info::{ArchivePath, FileId, FileInfo};
use freshet_core::predicate::Predicate;
use freshet_core::server_info::ServerInfo;
use freshet_core::spec_set::{Piece, PieceSpec};
use wire_protocol::{Message, PORT_HANDSHAKE_LEN, decode_port_handshake};

use crate::archive::{Archive, ArchiveOptions, DEFAULT_TTL_SECONDS};
use crate::clearing_house::ClearingHouse;
use crate::connection::Connection;
use crate::peer::{Peer, PeerOptions, PeerState};
use crate::tests::test_util::{
    patterned_content, predicate_wanting, setup_test_logging, write_archive_file,
};

const WAIT: Duration = Duration::from_secs(30);

// Large enough that one piece cannot fit the loopback socket buffers:
// the data sender stays wedged mid-write until the remote reads, which
// holds the session in Draining long enough to observe it.
const PIECE_SIZE: u32 = 8 << 20;

async fn poll_state(peer: &Peer, wanted: PeerState) {
    timeout(WAIT, async {
        while peer.state() != wanted {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("peer never reached {wanted:?}"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_satisfied_predicate_drains_session_without_cancel() {
    setup_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let big_content = patterned_content(11, PIECE_SIZE as usize);
    write_archive_file(dir.path(), "big.dat", &big_content);
    let archive = Archive::open(
        dir.path(),
        ArchiveOptions {
            default_piece_size: PIECE_SIZE,
            ..Default::default()
        },
    )
    .unwrap();
    let ch = ClearingHouse::new(archive.clone(), predicate_wanting(&["w.dat"]));
    let dispatch = tokio::spawn(ch.clone().run_new_file_dispatch());

    // Scripted remote: three raw listeners standing in for another node.
    let notice_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let request_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let data_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = ServerInfo::new(
        "127.0.0.1".parse().unwrap(),
        [
            notice_listener.local_addr().unwrap().port(),
            request_listener.local_addr().unwrap().port(),
            data_listener.local_addr().unwrap().port(),
        ],
    );

    let local_ports = [4242, 4243, 4244];
    let conn = Connection::connect(remote, local_ports, Duration::from_secs(5))
        .await
        .unwrap();
    // The dialer identifies itself on every socket.
    let mut sockets = Vec::new();
    for listener in [&notice_listener, &request_listener, &data_listener] {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut handshake = [0u8; PORT_HANDSHAKE_LEN];
        stream.read_exact(&mut handshake).await.unwrap();
        assert_eq!(decode_port_handshake(&handshake).unwrap(), local_ports);
        sockets.push(stream);
    }
    let mut data_stream = sockets.pop().unwrap();
    let mut request_stream = sockets.pop().unwrap();
    let _notice_stream = sockets.pop().unwrap();

    let peer = Arc::new(Peer::new(remote, &ch));
    let cancel = CancellationToken::new();
    let (disconnect_tx, mut disconnects) = broadcast::channel(8);
    let run = tokio::spawn({
        let peer = peer.clone();
        let cancel = cancel.clone();
        async move {
            peer.run(conn, PeerOptions::default(), cancel, disconnect_tx)
                .await
        }
    });
    poll_state(&peer, PeerState::Running).await;

    // The remote wants everything and asks for the big piece, then stops
    // reading its data socket.
    let big_info = FileInfo::new(
        FileId::new(ArchivePath::new("big.dat").unwrap()),
        big_content.len() as u64,
        PIECE_SIZE,
        DEFAULT_TTL_SECONDS,
    )
    .unwrap();
    let mut frames = Vec::new();
    Message::Predicate(Predicate::everything())
        .serialize(&mut frames)
        .unwrap();
    Message::Request(PieceSpec::new(big_info, 0).unwrap())
        .serialize(&mut frames)
        .unwrap();
    request_stream.write_all(&frames).await.unwrap();

    // The frame length header arrived: the piece write is under way.
    let mut probe = [0u8; 4];
    data_stream.read_exact(&mut probe).await.unwrap();

    // Satisfy the predicate locally. No cancellation anywhere.
    let wanted = FileInfo::new(
        FileId::new(ArchivePath::new("w.dat").unwrap()),
        3,
        PIECE_SIZE,
        DEFAULT_TTL_SECONDS,
    )
    .unwrap();
    archive.add_file(wanted.clone()).unwrap();
    archive
        .put_piece(
            &Piece::new(
                PieceSpec::new(wanted, 0).unwrap(),
                Bytes::from_static(b"abc"),
            )
            .unwrap(),
        )
        .unwrap();

    // The queues are closed, but the blocked piece write keeps the data
    // sender alive: the session sits in Draining, not force-cancelled.
    poll_state(&peer, PeerState::Draining).await;
    assert!(!cancel.is_cancelled());

    // Let the transfer finish; the senders complete on their own.
    let drain_remote = tokio::spawn(async move {
        let mut sink = tokio::io::sink();
        let _ = tokio::io::copy(&mut data_stream, &mut sink).await;
    });
    let result = timeout(WAIT, run).await.unwrap().unwrap();
    // Ok(()) is only produced by the senders branch; the drainer and
    // cancellation branches both report Cancelled.
    result.unwrap();
    assert_eq!(peer.state(), PeerState::Closed);

    let gone = timeout(WAIT, disconnects.recv()).await.unwrap().unwrap();
    assert_eq!(gone, remote);
    assert!(
        timeout(Duration::from_millis(300), disconnects.recv())
            .await
            .is_err()
    );

    drain_remote.await.unwrap();
    dispatch.abort();
}
