//! uTP Socket Integration Tests
//!
//! Socket pairs talking over loopback, plus raw peers for the cases a
//! well-behaved implementation never produces.


use std::net::SocketAddr;
use std::time::{Duration, Instant};

use raw_peer::{LossyProxy, RawPeer, RAW_WINDOW};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use utp_engine::{
    snapshot, Header, Listener, PacketType, SelectiveAckBitmask, StreamTransport, UtpConfig,
    UtpError, UtpSocket, UtpStream,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

async fn bind() -> UtpSocket {
    UtpSocket::bind(loopback()).await.unwrap()
}

/// Dial `b` from `a` and accept on `b`
async fn connect_pair(a: &UtpSocket, b: &UtpSocket) -> (UtpStream, UtpStream) {
    let (dialed, accepted) = timeout(TEST_TIMEOUT, async {
        tokio::join!(a.dial(b.local_addr()), b.accept())
    })
    .await
    .unwrap();
    (dialed.unwrap(), accepted.unwrap())
}

/// Read until end of stream
async fn read_to_end(stream: &UtpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 8192];
    loop {
        let n = stream.read(&mut buf).await.unwrap();
        if n == 0 {
            return out;
        }
        out.extend_from_slice(&buf[..n]);
    }
}

/// Poll until the reader task has applied the acks for every sent byte
async fn wait_until_all_acked(stream: &UtpStream) {
    timeout(TEST_TIMEOUT, async {
        while stream.stats().cur_window != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[tokio::test]
async fn test_handshake_ids() {
    let a = bind().await;
    let b = bind().await;
    let (dialed, accepted) = connect_pair(&a, &b).await;

    assert_eq!(dialed.send_id(), dialed.recv_id().wrapping_add(1));
    assert_eq!(dialed.recv_id(), accepted.send_id());
    assert_eq!(dialed.send_id(), accepted.recv_id());
    assert_eq!(dialed.peer_addr(), b.local_addr());
    assert_eq!(accepted.peer_addr(), a.local_addr());
}

#[tokio::test]
async fn test_bidirectional_transfer() {
    let a = bind().await;
    let b = bind().await;
    let (dialed, accepted) = connect_pair(&a, &b).await;

    dialed.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(TEST_TIMEOUT, accepted.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping");

    accepted.write_all(b"pong").await.unwrap();
    timeout(TEST_TIMEOUT, dialed.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"pong");
}

#[tokio::test]
async fn test_large_transfer() {
    let a = bind().await;
    let b = bind().await;
    let (dialed, accepted) = connect_pair(&a, &b).await;
    let data = test_data(1 << 20);

    let received = timeout(Duration::from_secs(30), async {
        let (_, received) = tokio::join!(
            async {
                dialed.write_all(&data).await.unwrap();
                dialed.close();
            },
            read_to_end(&accepted)
        );
        received
    })
    .await
    .unwrap();

    assert_eq!(received.len(), data.len());
    assert!(received == data);

    let stats = dialed.stats();
    assert!(stats.bytes_sent >= data.len() as u64);
    assert!(accepted.stats().bytes_received >= data.len() as u64);
}

#[tokio::test]
async fn test_close_gives_eof_and_rejects_writes() {
    let a = bind().await;
    let b = bind().await;
    let (dialed, accepted) = connect_pair(&a, &b).await;

    dialed.write_all(b"bye").await.unwrap();
    dialed.close();

    let received = timeout(TEST_TIMEOUT, read_to_end(&accepted)).await.unwrap();
    assert_eq!(received, b"bye");

    let err = dialed.write(b"more").await.unwrap_err();
    assert!(matches!(err, UtpError::Closed), "{err:?}");

    // End of stream is sticky
    let mut buf = [0u8; 8];
    assert_eq!(accepted.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn test_backlog_overflow_resets_oldest() {
    let config = UtpConfig {
        backlog: 1,
        ..Default::default()
    };
    let b = UtpSocket::bind_with_config(loopback(), config).await.unwrap();
    let raw = RawPeer::bind().await;
    let before = snapshot().backlog_evictions;

    raw.send(b.local_addr(), &Header::new(PacketType::Syn, 100, 7, 0), &[])
        .await;
    raw.send(b.local_addr(), &Header::new(PacketType::Syn, 200, 9, 0), &[])
        .await;

    let reset = raw.recv().await;
    assert_eq!(reset.header.packet_type, PacketType::Reset);
    assert_eq!(reset.header.conn_id, 100);
    assert_eq!(reset.header.ack_nr, 7);
    assert!(snapshot().backlog_evictions > before);

    // The newer SYN is still there to accept
    let accepted = timeout(TEST_TIMEOUT, b.accept()).await.unwrap().unwrap();
    assert_eq!(accepted.send_id(), 200);
    assert_eq!(accepted.recv_id(), 201);
}

#[tokio::test]
async fn test_selective_ack_and_reordering() {
    let b = bind().await;
    let raw = RawPeer::bind().await;
    let to = b.local_addr();
    let syn_seq: u16 = 1000;

    raw.send(to, &Header::new(PacketType::Syn, 50, syn_seq, 0).with_window(RAW_WINDOW), &[])
        .await;
    let accepted = timeout(TEST_TIMEOUT, b.accept()).await.unwrap().unwrap();
    let handshake = raw.recv_type(PacketType::State).await;
    assert_eq!(handshake.header.conn_id, 50);
    assert_eq!(handshake.header.ack_nr, syn_seq);

    let data = |seq: u16| Header::new(PacketType::Data, 51, seq, 0).with_window(RAW_WINDOW);

    // Second packet first: the ack must report it selectively
    raw.send(to, &data(syn_seq + 2), b"two").await;
    let state = raw
        .recv_until(|p| {
            p.header.packet_type == PacketType::State
                && p.header.selective_ack().is_some_and(|sack| sack.bit_is_set(0))
        })
        .await;
    assert_eq!(state.header.ack_nr, syn_seq);

    // Third, a duplicate of the second, then the first
    raw.send(to, &data(syn_seq + 3), b"three").await;
    raw.send(to, &data(syn_seq + 2), b"two").await;
    raw.send(to, &data(syn_seq + 1), b"one").await;

    let mut buf = vec![0u8; 11];
    timeout(TEST_TIMEOUT, accepted.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(buf, b"onetwothree");

    let state = raw
        .recv_until(|p| p.header.packet_type == PacketType::State && p.header.ack_nr == syn_seq + 3)
        .await;
    assert!(state.header.selective_ack().is_none());
}

#[tokio::test]
async fn test_early_retransmit_after_skipped_acks() {
    let a = bind().await;
    let raw = RawPeer::bind().await;
    let raw_addr = raw.local_addr();
    let before = snapshot().ack_skipped_resends;

    let (dialed, (syn, recv_id)) = tokio::join!(
        async { a.dial(raw_addr).await.unwrap() },
        raw.accept_syn(500)
    );
    assert_eq!(recv_id, dialed.recv_id());
    let syn_seq = syn.header.seq_nr;

    let payload = test_data(5 * 1384);
    dialed.write_all(&payload).await.unwrap();
    let mut seqs = Vec::new();
    while seqs.len() < 5 {
        let packet = raw.recv_type(PacketType::Data).await;
        seqs.push(packet.header.seq_nr);
    }
    let first = syn_seq.wrapping_add(1);
    assert_eq!(seqs, (0..5).map(|i| first.wrapping_add(i)).collect::<Vec<_>>());

    // Ack the first, skip the second, selectively ack the last three
    let mut sack = SelectiveAckBitmask::new();
    sack.set_bit(0);
    sack.set_bit(1);
    sack.set_bit(2);
    let state = Header::new(PacketType::State, recv_id, 500, first)
        .with_window(RAW_WINDOW)
        .with_selective_ack(sack);
    for _ in 0..3 {
        raw.send(syn.from, &state, &[]).await;
    }

    let resent = raw.recv_type(PacketType::Data).await;
    assert_eq!(resent.header.seq_nr, first.wrapping_add(1));
    assert_eq!(resent.payload, payload[1384..2 * 1384]);
    assert!(snapshot().ack_skipped_resends > before);

    // Everything acked: the window is empty again
    let all = Header::new(PacketType::State, recv_id, 500, first.wrapping_add(4)).with_window(RAW_WINDOW);
    raw.send(syn.from, &all, &[]).await;
    wait_until_all_acked(&dialed).await;
}

#[tokio::test]
async fn test_loss_recovery_through_proxy() {
    let a = bind().await;
    let b = bind().await;
    let proxy = LossyProxy::start(b.local_addr()).await;

    let (dialed, accepted) = timeout(TEST_TIMEOUT, async {
        tokio::join!(a.dial(proxy.local_addr()), b.accept())
    })
    .await
    .unwrap();
    let (dialed, accepted) = (dialed.unwrap(), accepted.unwrap());

    let data = test_data(100 * 1024);
    let received = timeout(Duration::from_secs(30), async {
        let (_, received) = tokio::join!(
            async {
                dialed.write_all(&data).await.unwrap();
                dialed.close();
            },
            read_to_end(&accepted)
        );
        received
    })
    .await
    .unwrap();

    assert!(received == data);
    assert!(dialed.stats().resends > 0);
}

#[tokio::test]
async fn test_peer_reset() {
    let a = bind().await;
    let raw = RawPeer::bind().await;
    let raw_addr = raw.local_addr();

    let (dialed, (syn, recv_id)) = tokio::join!(
        async { a.dial(raw_addr).await.unwrap() },
        raw.accept_syn(77)
    );

    raw.send(syn.from, &Header::new(PacketType::Reset, recv_id, 0, 0), &[])
        .await;

    let mut buf = [0u8; 16];
    let err = timeout(TEST_TIMEOUT, dialed.read(&mut buf))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, UtpError::PeerReset), "{err:?}");

    let err = dialed.write(b"x").await.unwrap_err();
    assert!(matches!(err, UtpError::Destroyed(_)), "{err:?}");
}

#[tokio::test]
async fn test_unexpected_packet_gets_resets() {
    let b = bind().await;
    let raw = RawPeer::bind().await;

    raw.send(b.local_addr(), &Header::new(PacketType::Data, 1000, 42, 0), b"stray")
        .await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        let reset = raw.recv().await;
        assert_eq!(reset.header.packet_type, PacketType::Reset);
        assert_eq!(reset.header.ack_nr, 42);
        ids.push(reset.header.conn_id);
    }
    assert_eq!(ids, vec![1000, 999, 1001]);

    // An unmatched reset is ignored
    raw.send(b.local_addr(), &Header::new(PacketType::Reset, 1000, 0, 0), &[])
        .await;
    assert!(raw.recv_within(Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn test_read_deadline() {
    let a = bind().await;
    let b = bind().await;
    let (dialed, accepted) = connect_pair(&a, &b).await;

    dialed.set_read_deadline(Some(Instant::now() + Duration::from_millis(100)));
    let mut buf = [0u8; 16];
    let err = timeout(TEST_TIMEOUT, dialed.read(&mut buf))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, UtpError::DeadlineExceeded), "{err:?}");
    assert!(err.is_timeout());

    // Clearing the deadline makes the stream usable again
    dialed.set_read_deadline(None);
    accepted.write_all(b"late").await.unwrap();
    let n = timeout(TEST_TIMEOUT, dialed.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"late");
}

#[tokio::test]
async fn test_idle_peer_times_out() {
    let config = UtpConfig {
        packet_read_timeout_secs: 1,
        ..Default::default()
    };
    let a = UtpSocket::bind_with_config(loopback(), config).await.unwrap();
    let raw = RawPeer::bind().await;
    let raw_addr = raw.local_addr();

    // The peer completes the handshake and then goes silent
    let (dialed, _) = tokio::join!(
        async { a.dial(raw_addr).await.unwrap() },
        raw.accept_syn(50)
    );

    let mut buf = [0u8; 16];
    let err = timeout(TEST_TIMEOUT, dialed.read(&mut buf))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, UtpError::IdleTimeout(_)), "{err:?}");
    assert!(err.is_timeout());
}

#[tokio::test]
async fn test_write_deadline() {
    let a = bind().await;
    let raw = RawPeer::bind().await;
    let raw_addr = raw.local_addr();

    let (dialed, _) = tokio::join!(
        async { a.dial(raw_addr).await.unwrap() },
        raw.accept_syn_with_window(300, 100)
    );
    dialed.set_write_deadline(Some(Instant::now() + Duration::from_millis(200)));

    // The window takes 100 bytes, then the deadline cuts the write short
    let n = timeout(TEST_TIMEOUT, dialed.write(&[7u8; 300]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 100);

    let err = timeout(TEST_TIMEOUT, dialed.write(&[7u8; 300]))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, UtpError::DeadlineExceeded), "{err:?}");

    let data = raw.recv_type(PacketType::Data).await;
    assert_eq!(data.payload.len(), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deadline_set_outside_runtime_wakes_reader() {
    let a = bind().await;
    let b = bind().await;
    let (dialed, _accepted) = connect_pair(&a, &b).await;

    // A plain thread has no runtime context; the deadline timer must still run
    let dialed = std::thread::spawn(move || {
        dialed.set_read_deadline(Some(Instant::now() + Duration::from_millis(100)));
        dialed
    })
    .join()
    .unwrap();

    let mut buf = [0u8; 16];
    let err = timeout(TEST_TIMEOUT, dialed.read(&mut buf))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, UtpError::DeadlineExceeded), "{err:?}");
}

#[tokio::test]
async fn test_dial_cancel() {
    let a = bind().await;
    let silent = RawPeer::bind().await;
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = timeout(TEST_TIMEOUT, a.dial_with_cancel(silent.local_addr(), cancel))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, UtpError::Cancelled), "{err:?}");

    // The SYN did go out
    let syn = silent.recv().await;
    assert_eq!(syn.header.packet_type, PacketType::Syn);
}

#[tokio::test]
async fn test_dial_timeout() {
    let config = UtpConfig {
        connect_timeout_secs: 1,
        ..Default::default()
    };
    let a = UtpSocket::bind_with_config(loopback(), config).await.unwrap();
    let silent = RawPeer::bind().await;

    let err = timeout(TEST_TIMEOUT, a.dial(silent.local_addr()))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, UtpError::ConnectTimeout), "{err:?}");
    assert!(err.is_timeout());
}

#[tokio::test]
async fn test_small_peer_window_limits_sends() {
    let a = bind().await;
    let raw = RawPeer::bind().await;
    let raw_addr = raw.local_addr();

    let (dialed, (syn, recv_id)) = tokio::join!(
        async { a.dial(raw_addr).await.unwrap() },
        raw.accept_syn_with_window(300, 1000)
    );
    let writer = tokio::spawn(async move {
        dialed.write_all(&test_data(3000)).await.unwrap();
        dialed
    });

    let mut last = None;
    for _ in 0..3 {
        let packet = raw.recv_type(PacketType::Data).await;
        assert_eq!(packet.payload.len(), 1000);
        if let Some(prev) = last {
            assert_eq!(packet.header.seq_nr, u16::wrapping_add(prev, 1));
        }
        // Nothing more until the window reopens
        assert!(raw.recv_within(Duration::from_millis(200)).await.is_none());

        let ack = Header::new(PacketType::State, recv_id, 300, packet.header.seq_nr).with_window(1000);
        raw.send(syn.from, &ack, &[]).await;
        last = Some(packet.header.seq_nr);
    }

    // The writer finishes once the last packet is queued, not acked
    let dialed = timeout(TEST_TIMEOUT, writer).await.unwrap().unwrap();
    wait_until_all_acked(&dialed).await;
    assert_eq!(dialed.stats().cur_window, 0);
}

#[tokio::test]
async fn test_non_utp_passthrough() {
    let b = bind().await;
    let raw = RawPeer::bind().await;
    let before = snapshot().malformed_packets;

    raw.send_raw(b.local_addr(), b"d1:ad2:id20:").await;
    let mut buf = [0u8; 64];
    let (n, from) = timeout(TEST_TIMEOUT, b.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"d1:ad2:id20:");
    assert_eq!(from, raw.local_addr());
    assert!(snapshot().malformed_packets > before);

    b.send_to(b"pong", raw.local_addr()).unwrap();
    let (data, from) = raw.recv_raw_within(TEST_TIMEOUT).await.unwrap();
    assert_eq!(data, b"pong");
    assert_eq!(from, b.local_addr());
}

#[tokio::test]
async fn test_accept_filter_refuses_dial() {
    let config = UtpConfig::default().with_accept_filter(|_| false);
    let b = UtpSocket::bind_with_config(loopback(), config).await.unwrap();
    let a = bind().await;

    let err = timeout(TEST_TIMEOUT, a.dial(b.local_addr()))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, UtpError::PeerReset), "{err:?}");
}

#[tokio::test]
async fn test_closed_socket_refuses_work() {
    let a = bind().await;
    let b = bind().await;
    b.close();

    let err = timeout(TEST_TIMEOUT, b.accept()).await.unwrap().unwrap_err();
    assert!(matches!(err, UtpError::SocketClosed), "{err:?}");

    let err = b.dial(a.local_addr()).await.unwrap_err();
    assert!(matches!(err, UtpError::SocketClosed), "{err:?}");
}

#[tokio::test]
async fn test_close_keeps_established_streams() {
    let a = bind().await;
    let b = bind().await;
    let (dialed, accepted) = connect_pair(&a, &b).await;

    b.close();
    dialed.write_all(b"still here").await.unwrap();
    let mut buf = [0u8; 10];
    timeout(TEST_TIMEOUT, accepted.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"still here");
}

#[tokio::test]
async fn test_shutdown_now_destroys_streams() {
    let a = bind().await;
    let b = bind().await;
    let (_dialed, accepted) = connect_pair(&a, &b).await;

    b.shutdown_now();
    let mut buf = [0u8; 4];
    let err = timeout(TEST_TIMEOUT, accepted.read(&mut buf))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, UtpError::SocketDestroyed(_)), "{err:?}");

    let err = timeout(TEST_TIMEOUT, b.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, UtpError::SocketDestroyed(_)), "{err:?}");
}

async fn echo_once<L: Listener>(listener: &L) {
    let mut stream = listener.accept().await.unwrap();
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await.unwrap();
    stream.write_all(&buf).await.unwrap();
    stream.shutdown().await.unwrap();
}

async fn say_hello<S: StreamTransport>(mut stream: S) -> Vec<u8> {
    stream.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await.unwrap();
    let mut rest = [0u8; 1];
    assert_eq!(stream.read(&mut rest).await.unwrap(), 0);
    buf.to_vec()
}

#[tokio::test]
async fn test_transport_traits() {
    let a = bind().await;
    let b = bind().await;
    let addr = Listener::local_addr(&b).unwrap();

    let reply = timeout(TEST_TIMEOUT, async {
        let (_, reply) = tokio::join!(echo_once(&b), async {
            let stream = a.dial(addr).await.unwrap();
            say_hello(stream).await
        });
        reply
    })
    .await
    .unwrap();
    assert_eq!(reply, b"hello");
}
