//! Connection behavior against a scripted peer on the other end of a pipe

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use outpost_proto::{Envelope, EnvelopeCodec, MessageKind, TunnelData};
use outpost_transport::{CloseReason, Connection, ConnectionConfig, ConnectionError, TunnelError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

struct Peer {
    reader: FramedRead<ReadHalf<DuplexStream>, EnvelopeCodec>,
    writer: FramedWrite<WriteHalf<DuplexStream>, EnvelopeCodec>,
}

impl Peer {
    async fn recv(&mut self) -> Envelope {
        tokio::time::timeout(Duration::from_secs(5), self.reader.next())
            .await
            .expect("peer read timed out")
            .expect("stream ended")
            .expect("decode failed")
    }

    async fn send(&mut self, envelope: Envelope) {
        self.writer.send(envelope).await.unwrap();
    }
}

fn connect() -> (Arc<Connection>, Peer) {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let conn = Connection::start(local, "pipe", ConnectionConfig::default());

    let (read_half, write_half) = tokio::io::split(remote);
    let peer = Peer {
        reader: FramedRead::new(read_half, EnvelopeCodec::new()),
        writer: FramedWrite::new(write_half, EnvelopeCodec::new()),
    };

    (conn, peer)
}

fn tunnel_envelope(tunnel_id: u64, data: &[u8], closed: bool) -> Envelope {
    Envelope::request(
        MessageKind::TunnelData,
        &TunnelData {
            tunnel_id,
            sequence: 0,
            data: data.to_vec(),
            closed,
        },
    )
    .unwrap()
}

async fn wait_closed(conn: &Connection) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !conn.is_closed() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("connection did not close");
}

#[tokio::test]
async fn test_sends_arrive_in_enqueue_order() {
    let (conn, mut peer) = connect();

    for i in 0..100 {
        conn.send(Envelope::new("ping", vec![]).with_id(i.to_string()))
            .await
            .unwrap();
    }

    for i in 0..100 {
        assert_eq!(peer.recv().await.id, i.to_string());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_senders_keep_per_sender_order() {
    let (conn, mut peer) = connect();

    let mut handles = Vec::new();
    for sender in 0..4 {
        let conn = conn.clone();
        handles.push(tokio::spawn(async move {
            for seq in 0..50 {
                conn.send(Envelope::new("ping", vec![]).with_id(format!("{}-{}", sender, seq)))
                    .await
                    .unwrap();
            }
        }));
    }

    let mut last_seen = [-1i32; 4];
    for _ in 0..200 {
        let env = peer.recv().await;
        let (sender, seq) = env.id.split_once('-').unwrap();
        let sender: usize = sender.parse().unwrap();
        let seq: i32 = seq.parse().unwrap();

        assert_eq!(seq, last_seen[sender] + 1);
        last_seen[sender] = seq;
    }

    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_receive_from_peer() {
    let (conn, mut peer) = connect();

    peer.send(Envelope::new("register", vec![1, 2, 3])).await;

    let env = conn.receive().await.unwrap();
    assert_eq!(env.kind, "register");
    assert_eq!(env.data, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_peer_eof_tears_down() {
    let (conn, peer) = connect();

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_clone = fired.clone();
    conn.on_close(move || {
        fired_clone.fetch_add(1, Ordering::SeqCst);
    });

    drop(peer);

    assert!(conn.receive().await.is_none());
    wait_closed(&conn).await;
    assert_eq!(conn.close_reason(), Some(CloseReason::Eof));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_truncated_frame_is_decode_error() {
    let (local, mut remote) = tokio::io::duplex(1024);
    let conn = Connection::start(local, "pipe", ConnectionConfig::default());

    let frame = EnvelopeCodec::encode_frame(&Envelope::new("ls", vec![9; 64])).unwrap();
    remote.write_all(&frame[..frame.len() - 8]).await.unwrap();
    drop(remote);

    // No partial envelope is ever delivered
    assert!(conn.receive().await.is_none());
    wait_closed(&conn).await;
    assert!(matches!(conn.close_reason(), Some(CloseReason::Decode(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_cleanup_runs_once() {
    let (conn, _peer) = connect();

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_clone = fired.clone();
    conn.on_close(move || {
        fired_clone.fetch_add(1, Ordering::SeqCst);
    });

    let mut handles = Vec::new();
    for i in 0..8 {
        let conn = conn.clone();
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                conn.close()
            } else {
                conn.cleanup(CloseReason::Transport("simulated".to_string()))
            }
        }));
    }

    let mut performed = 0;
    for handle in handles {
        if handle.await.unwrap() {
            performed += 1;
        }
    }

    assert_eq!(performed, 1);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_queued_sends_flushed_on_close() {
    let (conn, mut peer) = connect();

    conn.try_send(Envelope::new("kill", vec![]).with_id("a")).unwrap();
    conn.try_send(Envelope::new("kill", vec![]).with_id("b")).unwrap();
    conn.close();

    assert_eq!(peer.recv().await.id, "a");
    assert_eq!(peer.recv().await.id, "b");
    assert!(peer.reader.next().await.is_none());

    assert!(matches!(
        conn.send(Envelope::new("ping", vec![])).await,
        Err(ConnectionError::Closed)
    ));
}

#[tokio::test]
async fn test_tunnel_roundtrip() {
    let (conn, mut peer) = connect();
    let mut tunnel = conn.open_tunnel().unwrap();
    assert_eq!(conn.tunnel_count(), 1);

    tunnel.write(Bytes::from_static(b"GET / HTTP/1.0\r\n\r\n")).await.unwrap();

    let env = peer.recv().await;
    assert!(env.is_tunnel());
    let chunk: TunnelData = env.decode_payload().unwrap();
    assert_eq!(chunk.tunnel_id, tunnel.id());
    assert_eq!(chunk.data, b"GET / HTTP/1.0\r\n\r\n");
    assert!(!chunk.closed);

    peer.send(tunnel_envelope(tunnel.id(), b"HTTP/1.0 200 OK", false)).await;
    assert_eq!(tunnel.read().await.unwrap(), Bytes::from_static(b"HTTP/1.0 200 OK"));

    let id = tunnel.id();
    tunnel.close().await.unwrap();
    assert_eq!(conn.tunnel_count(), 0);

    let env = peer.recv().await;
    let chunk: TunnelData = env.decode_payload().unwrap();
    assert_eq!(chunk.tunnel_id, id);
    assert!(chunk.closed);

    // Parent connection is unaffected
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn test_unknown_tunnel_dropped() {
    let (conn, mut peer) = connect();

    peer.send(tunnel_envelope(42, b"stray", false)).await;
    peer.send(Envelope::new("ping", vec![]).with_id("after")).await;

    // Tunnel traffic never reaches the receive queue
    let env = conn.receive().await.unwrap();
    assert_eq!(env.id, "after");
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn test_peer_closes_tunnel() {
    let (conn, mut peer) = connect();
    let mut tunnel = conn.accept_tunnel(5).unwrap();

    assert_eq!(
        conn.accept_tunnel(5).err(),
        Some(TunnelError::AlreadyExists(5))
    );

    peer.send(tunnel_envelope(5, b"last", true)).await;

    assert_eq!(tunnel.read().await.unwrap(), Bytes::from_static(b"last"));
    assert!(tunnel.read().await.is_none());
    assert_eq!(
        tunnel.write(Bytes::from_static(b"x")).await,
        Err(TunnelError::Closed(5))
    );
}

#[tokio::test]
async fn test_connection_close_ends_tunnels() {
    let (conn, _peer) = connect();
    let mut first = conn.open_tunnel().unwrap();
    let mut second = conn.open_tunnel().unwrap();

    let reader = tokio::spawn(async move { first.read().await });

    conn.close();

    assert!(reader.await.unwrap().is_none());
    assert!(second.read().await.is_none());
    assert!(matches!(
        second.write(Bytes::from_static(b"x")).await,
        Err(TunnelError::Closed(_))
    ));
}
