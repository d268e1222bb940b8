//! Listener behavior: bind conflicts, raw-byte delivery, cross-thread close.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use kiln::{ConnHandle, ConnState, Error, LoopGroup, ServerBuilder};

#[test]
fn test_bind_conflict_is_reported() {
    let holder = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = holder.local_addr().unwrap();

    let group = LoopGroup::new(1).unwrap();
    let alloc = group.allocator();
    match ServerBuilder::new("127.0.0.1", addr.port()).start(&alloc) {
        Err(Error::Bind { .. }) => {}
        Err(other) => panic!("expected a bind error, got {other}"),
        Ok(_) => panic!("bind to an in-use address unexpectedly succeeded"),
    }

    group.exit_all();
    group.run();
}

#[test]
fn test_raw_read_echo() {
    let group = LoopGroup::new(1).unwrap();
    let alloc = group.allocator();
    let handles: Vec<_> = group.handles().to_vec();

    let server = ServerBuilder::new("127.0.0.1", 0)
        .conn_read(|conn, buf| {
            let data = buf.data().to_vec();
            buf.consume(data.len());
            conn.send(&data);
        })
        .start(&alloc)
        .unwrap();
    let addr = server.local_addr();

    let runner = thread::spawn(move || group.run());

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client.write_all(b"ping").unwrap();

    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"ping");

    drop(client);
    for h in &handles {
        h.exit();
    }
    runner.join().unwrap();
}

#[derive(Debug)]
enum Event {
    Conn(ConnHandle),
    ClosedOn(ThreadId),
    LoopThread(ThreadId),
}

#[test]
fn test_cross_thread_close_runs_teardown_on_loop_thread() {
    let group = LoopGroup::new(1).unwrap();
    let alloc = group.allocator();
    let handles: Vec<_> = group.handles().to_vec();

    let (tx, rx) = mpsc::channel();
    let tx_loop = tx.clone();
    handles[0].post(move |_| {
        let _ = tx_loop.send(Event::LoopThread(thread::current().id()));
    });

    let tx_init = tx.clone();
    let tx_state = tx.clone();
    let server = ServerBuilder::new("127.0.0.1", 0)
        .conn_init(move |conn| {
            let _ = tx_init.send(Event::Conn(conn.handle()));
        })
        .conn_state(move |conn| {
            if conn.state() == ConnState::Closed {
                let _ = tx_state.send(Event::ClosedOn(thread::current().id()));
            }
        })
        .start(&alloc)
        .unwrap();
    let addr = server.local_addr();

    let runner = thread::spawn(move || group.run());
    let client = TcpStream::connect(addr).unwrap();

    let timeout = Duration::from_secs(5);
    let loop_thread = match rx.recv_timeout(timeout).unwrap() {
        Event::LoopThread(id) => id,
        other => panic!("expected loop thread id, got {other:?}"),
    };
    let conn_handle = match rx.recv_timeout(timeout).unwrap() {
        Event::Conn(handle) => handle,
        other => panic!("expected connection handle, got {other:?}"),
    };

    // close from a thread that does not own the loop
    let closer = thread::spawn(move || {
        assert!(conn_handle.close());
        thread::current().id()
    });
    let closer_thread = closer.join().unwrap();

    let closed_on = match rx.recv_timeout(timeout).unwrap() {
        Event::ClosedOn(id) => id,
        other => panic!("expected close notification, got {other:?}"),
    };
    assert_eq!(closed_on, loop_thread);
    assert_ne!(closed_on, closer_thread);

    drop(client);
    for h in &handles {
        h.exit();
    }
    runner.join().unwrap();
}
