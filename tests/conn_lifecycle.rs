//! Connection lifecycle: reconnect pacing and idle expiry.

use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use kiln::{ConnState, LoopGroup, ServerBuilder, TcpConn};

/// Pick a port with nothing listening on it.
fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[test]
fn test_reconnect_waits_configured_interval() {
    let group = LoopGroup::new(1).unwrap();
    let alloc = group.allocator();
    let handles: Vec<_> = group.handles().to_vec();
    let port = free_port();

    let (tx, rx) = mpsc::channel();
    alloc.allocate().post(move |l| {
        let conn = TcpConn::connect(l, "127.0.0.1", port);
        conn.set_reconnect_interval(200);
        conn.set_state_callback(move |c| {
            if c.state() == ConnState::Failed {
                let _ = tx.send(Instant::now());
            }
        });
    });

    let runner = thread::spawn(move || group.run());

    let timeout = Duration::from_secs(5);
    let first = rx.recv_timeout(timeout).unwrap();
    let second = rx.recv_timeout(timeout).unwrap();
    let gap = second.duration_since(first);
    assert!(
        gap >= Duration::from_millis(150),
        "re-attempt came too early: {gap:?}"
    );
    assert!(
        gap <= Duration::from_millis(1500),
        "re-attempt came too late: {gap:?}"
    );

    for h in &handles {
        h.exit();
    }
    runner.join().unwrap();
}

#[test]
fn test_idle_watch_closes_silent_connection() {
    let group = LoopGroup::new(1).unwrap();
    let alloc = group.allocator();
    let handles: Vec<_> = group.handles().to_vec();

    let (tx, rx) = mpsc::channel();
    let tx_state = tx.clone();
    let server = ServerBuilder::new("127.0.0.1", 0)
        .conn_init(|conn| {
            conn.add_idle_watch(1, |c| c.close());
        })
        .conn_state(move |conn| {
            if conn.state() == ConnState::Closed {
                let _ = tx_state.send(Instant::now());
            }
        })
        .start(&alloc)
        .unwrap();
    let addr = server.local_addr();

    let runner = thread::spawn(move || group.run());

    let start = Instant::now();
    let client = TcpStream::connect(addr).unwrap();
    // stay silent; the idle watch should close the connection
    let closed_at = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let elapsed = closed_at.duration_since(start);
    assert!(
        elapsed >= Duration::from_millis(900),
        "closed before the idle threshold: {elapsed:?}"
    );
    assert!(
        elapsed <= Duration::from_millis(3500),
        "idle close came too late: {elapsed:?}"
    );

    drop(client);
    for h in &handles {
        h.exit();
    }
    runner.join().unwrap();
}

#[test]
fn test_connect_timeout_fails_handshake() {
    let group = LoopGroup::new(1).unwrap();
    let alloc = group.allocator();
    let handles: Vec<_> = group.handles().to_vec();

    let (tx, rx) = mpsc::channel();
    alloc.allocate().post(move |l| {
        // RFC 5737 TEST-NET-1: routes nowhere, so the connect just hangs
        let conn = TcpConn::connect_with(l, "192.0.2.1", 9, 200, "");
        conn.set_state_callback(move |c| {
            let _ = tx.send((c.state(), Instant::now()));
        });
    });

    let runner = thread::spawn(move || group.run());

    let start = Instant::now();
    let (state, at) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(state, ConnState::Failed);
    // a blackholed connect fails via the 200ms timeout; an unroutable one
    // fails faster through the normal handshake path
    let elapsed = at.duration_since(start);
    assert!(
        elapsed <= Duration::from_millis(2000),
        "timed out too late: {elapsed:?}"
    );

    for h in &handles {
        h.exit();
    }
    runner.join().unwrap();
}
