//! End-to-end echo over a loop group with length-prefixed framing.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use kiln::{ConnState, LengthCodec, LoopGroup, ServerBuilder, TcpConn};

#[derive(Debug)]
enum Event {
    Msg(Vec<u8>),
    State(ConnState),
}

#[test]
fn test_length_prefixed_echo_roundtrip() {
    let group = LoopGroup::new(2).unwrap();
    let alloc = group.allocator();
    let handles: Vec<_> = group.handles().to_vec();

    // Server echoes each message, then closes its side of the connection.
    let server = ServerBuilder::new("127.0.0.1", 0)
        .conn_msg(Box::new(LengthCodec::default()), |conn, payload| {
            conn.send_msg(payload);
            conn.close();
        })
        .start(&alloc)
        .unwrap();
    let addr = server.local_addr();

    let (tx, rx) = mpsc::channel();
    let client_loop = alloc.allocate();
    client_loop.post(move |l| {
        let conn = TcpConn::connect(l, "127.0.0.1", addr.port());
        let tx_msg = tx.clone();
        conn.set_message_callback(Box::new(LengthCodec::default()), move |_c, payload| {
            let _ = tx_msg.send(Event::Msg(payload.to_vec()));
        });
        let tx_state = tx.clone();
        conn.set_state_callback(move |c| {
            let state = c.state();
            if state == ConnState::Connected {
                c.send_msg(b"hello");
            }
            let _ = tx_state.send(Event::State(state));
        });
    });

    let runner = thread::spawn(move || group.run());

    let timeout = Duration::from_secs(5);
    match rx.recv_timeout(timeout).unwrap() {
        Event::State(ConnState::Connected) => {}
        other => panic!("expected Connected first, got {other:?}"),
    }
    match rx.recv_timeout(timeout).unwrap() {
        Event::Msg(payload) => assert_eq!(payload, b"hello"),
        other => panic!("expected echoed message, got {other:?}"),
    }
    match rx.recv_timeout(timeout).unwrap() {
        Event::State(ConnState::Closed) => {}
        other => panic!("expected Closed after server hangup, got {other:?}"),
    }

    for h in &handles {
        h.exit();
    }
    runner.join().unwrap();
}

#[test]
fn test_multiple_messages_one_connection() {
    let group = LoopGroup::new(1).unwrap();
    let alloc = group.allocator();
    let handles: Vec<_> = group.handles().to_vec();

    let server = ServerBuilder::new("127.0.0.1", 0)
        .conn_msg(Box::new(LengthCodec::default()), |conn, payload| {
            conn.send_msg(payload);
        })
        .start(&alloc)
        .unwrap();
    let addr = server.local_addr();

    let (tx, rx) = mpsc::channel();
    alloc.allocate().post(move |l| {
        let conn = TcpConn::connect(l, "127.0.0.1", addr.port());
        let tx_msg = tx.clone();
        conn.set_message_callback(Box::new(LengthCodec::default()), move |_c, payload| {
            let _ = tx_msg.send(payload.to_vec());
        });
        conn.set_state_callback(move |c| {
            if c.state() == ConnState::Connected {
                for msg in [b"one".as_slice(), b"two", b"three"] {
                    c.send_msg(msg);
                }
            }
        });
    });

    let runner = thread::spawn(move || group.run());

    let timeout = Duration::from_secs(5);
    assert_eq!(rx.recv_timeout(timeout).unwrap(), b"one");
    assert_eq!(rx.recv_timeout(timeout).unwrap(), b"two");
    assert_eq!(rx.recv_timeout(timeout).unwrap(), b"three");

    for h in &handles {
        h.exit();
    }
    runner.join().unwrap();
}
