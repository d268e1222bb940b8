//! TCP connection state machine.
//!
//! A connection moves `Invalid → Handshaking → Connected → {Closed |
//! Failed}`. Handshaking is entered either by a server-side attach of an
//! accepted descriptor or by a client-side non-blocking connect, and is
//! confirmed by writable-readiness plus a pending-socket-error check. When a
//! non-negative reconnect interval is configured, both terminal states
//! schedule a re-attempt instead of permanent destruction: the connection
//! object survives, only its descriptor and source are discarded and
//! rebuilt.
//!
//! [`TcpConn`] is a cheap clone handle confined to the owning loop's thread.
//! [`ConnHandle`] is the `Send` face; its close marshals onto the loop.

use std::cell::RefCell;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::{IntoRawFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use socket2::{Domain, SockAddr, Socket, Type};
use tracing::{debug, error, info, trace, warn};

use crate::addr::Addr;
use crate::buffer::Buffer;
use crate::clock;
use crate::codec::Codec;
use crate::event_loop::{EventLoop, IdleId, LoopHandle, TimerId};
use crate::metrics;
use crate::source::EventSource;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Invalid,
    Handshaking,
    Connected,
    Closed,
    Failed,
}

/// How inbound bytes reach the application. A connection speaks either raw
/// bytes or framed messages, never both; the tagged variants make the
/// conflicting combination unrepresentable.
enum Delivery {
    None,
    Raw(Box<dyn FnMut(&TcpConn, &mut Buffer)>),
    Framed {
        codec: Box<dyn Codec>,
        on_msg: Box<dyn FnMut(&TcpConn, &[u8])>,
    },
}

struct ConnInner {
    id: u64,
    owner: EventLoop,
    state: ConnState,
    source: Option<EventSource>,
    input: Buffer,
    output: Buffer,
    local: Addr,
    peer: Addr,
    delivery: Delivery,
    state_cb: Option<Box<dyn FnMut(&TcpConn)>>,
    drained_cb: Option<Box<dyn FnMut(&TcpConn)>>,
    idle_ids: Vec<IdleId>,
    timeout_timer: Option<TimerId>,
    /// Waiting on a scheduled reconnect; the descriptor and source are gone.
    parked: bool,
    /// Reentrancy guard for the teardown path.
    cleaning: bool,
    is_client: bool,
    dest_host: String,
    dest_port: u16,
    local_ip: String,
    connect_timeout: u64,
    /// -1 disables reconnect, 0 retries immediately, >0 waits that long
    /// measured from the previous connect time.
    reconnect_interval: i64,
    connected_time: u64,
}

/// Handle to a connection, usable only on the owning loop's thread.
#[derive(Clone)]
pub struct TcpConn {
    inner: Rc<RefCell<ConnInner>>,
}

/// Thread-safe handle to a connection. Closing defers to the owning loop's
/// thread, so teardown never runs on the caller's thread.
#[derive(Clone)]
pub struct ConnHandle {
    owner: LoopHandle,
    id: u64,
}

impl std::fmt::Debug for ConnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnHandle")
            .field("loop", &self.owner.id())
            .field("id", &self.id)
            .finish()
    }
}

impl ConnHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Request a close on the owning loop. Idempotent; returns false if the
    /// loop is no longer accepting work.
    pub fn close(&self) -> bool {
        let id = self.id;
        self.owner.post(move |l| {
            if let Some(conn) = l.conn_by_id(id) {
                close_source(&conn);
            }
        })
    }
}

impl TcpConn {
    fn new_on(owner: &EventLoop) -> TcpConn {
        TcpConn {
            inner: Rc::new(RefCell::new(ConnInner {
                id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
                owner: owner.clone(),
                state: ConnState::Invalid,
                source: None,
                input: Buffer::new(),
                output: Buffer::new(),
                local: Addr::invalid(),
                peer: Addr::invalid(),
                delivery: Delivery::None,
                state_cb: None,
                drained_cb: None,
                idle_ids: Vec::new(),
                timeout_timer: None,
                parked: false,
                cleaning: false,
                is_client: false,
                dest_host: String::new(),
                dest_port: 0,
                local_ip: String::new(),
                connect_timeout: 0,
                reconnect_interval: -1,
                connected_time: clock::now_ms(),
            })),
        }
    }

    /// Adopt an already-connected descriptor (server side).
    pub fn attach(owner: &EventLoop, fd: RawFd, local: Addr, peer: Addr) -> TcpConn {
        let conn = TcpConn::new_on(owner);
        attach_fd(&conn, fd, local, peer);
        conn
    }

    /// Start an outbound connection. Failures, including resolution
    /// failures, surface through the state callback, not a return value.
    pub fn connect(owner: &EventLoop, host: &str, port: u16) -> TcpConn {
        TcpConn::connect_with(owner, host, port, 0, "")
    }

    /// Outbound connection with a connect timeout in milliseconds (0 means
    /// none) and an optional local address to bind.
    pub fn connect_with(
        owner: &EventLoop,
        host: &str,
        port: u16,
        timeout_ms: u64,
        local_ip: &str,
    ) -> TcpConn {
        let conn = TcpConn::new_on(owner);
        start_connect(&conn, host, port, timeout_ms, local_ip);
        conn
    }

    pub fn id(&self) -> u64 {
        self.inner.borrow().id
    }

    pub fn state(&self) -> ConnState {
        self.inner.borrow().state
    }

    pub fn local_addr(&self) -> Addr {
        self.inner.borrow().local
    }

    pub fn peer_addr(&self) -> Addr {
        self.inner.borrow().peer
    }

    /// Bytes accepted by [`TcpConn::send`] but not yet handed to the socket.
    pub fn write_pending(&self) -> usize {
        self.inner.borrow().output.len()
    }

    /// The thread-safe handle for this connection.
    pub fn handle(&self) -> ConnHandle {
        let inner = self.inner.borrow();
        ConnHandle {
            owner: inner.owner.handle(),
            id: inner.id,
        }
    }

    /// Suggested chunk size for the input buffer.
    pub fn set_buffer_chunk(&self, size: usize) {
        self.inner.borrow_mut().input.set_chunk_hint(size);
    }

    /// Deliver raw bytes to `cb` as they arrive. Conflicts with
    /// [`TcpConn::set_message_callback`]; installing both is a usage error.
    pub fn set_read_callback(&self, cb: impl FnMut(&TcpConn, &mut Buffer) + 'static) {
        let mut inner = self.inner.borrow_mut();
        assert!(
            !matches!(inner.delivery, Delivery::Framed { .. }),
            "read callback conflicts with an installed message callback"
        );
        inner.delivery = Delivery::Raw(Box::new(cb));
    }

    /// Deliver framed messages decoded by `codec` to `cb`. Conflicts with
    /// [`TcpConn::set_read_callback`]; installing both is a usage error.
    pub fn set_message_callback(
        &self,
        codec: Box<dyn Codec>,
        cb: impl FnMut(&TcpConn, &[u8]) + 'static,
    ) {
        let mut inner = self.inner.borrow_mut();
        assert!(
            !matches!(inner.delivery, Delivery::Raw(_)),
            "message callback conflicts with an installed read callback"
        );
        inner.delivery = Delivery::Framed {
            codec,
            on_msg: Box::new(cb),
        };
    }

    /// Invoked on every state transition; inspect [`TcpConn::state`] inside.
    pub fn set_state_callback(&self, cb: impl FnMut(&TcpConn) + 'static) {
        self.inner.borrow_mut().state_cb = Some(Box::new(cb));
    }

    /// Invoked each time the output buffer drains to empty.
    pub fn set_write_drained_callback(&self, cb: impl FnMut(&TcpConn) + 'static) {
        self.inner.borrow_mut().drained_cb = Some(Box::new(cb));
    }

    /// Fire `cb` whenever no read activity has occurred for `seconds`.
    pub fn add_idle_watch(&self, seconds: u64, cb: impl Fn(&TcpConn) + 'static) {
        let has_source = self.inner.borrow().source.is_some();
        if !has_source {
            return;
        }
        let owner = self.inner.borrow().owner.clone();
        let id = owner.register_idle(seconds, self.clone(), Rc::new(cb));
        self.inner.borrow_mut().idle_ids.push(id);
    }

    /// -1 disables reconnect, 0 retries immediately, >0 waits that many
    /// milliseconds from the previous connect time.
    pub fn set_reconnect_interval(&self, millis: i64) {
        self.inner.borrow_mut().reconnect_interval = millis;
    }

    /// Queue the caller's bytes plus anything already pending. Only the
    /// unsent remainder is retained; write-readiness interest is enabled
    /// only while a remainder exists.
    pub fn send(&self, data: &[u8]) {
        let (has_source, output_empty) = {
            let inner = self.inner.borrow();
            let live = matches!(&inner.source, Some(s) if !s.is_closed());
            (live, inner.output.is_empty())
        };
        if !has_source {
            warn!(bytes = data.len(), "connection closed, dropping write");
            return;
        }
        let mut sent = 0;
        if output_empty {
            sent = isend(self, data);
        }
        if sent < data.len() {
            self.inner.borrow_mut().output.append(&data[sent..]);
        }
    }

    /// Frame `payload` through the installed codec and send it. Calling
    /// without a message callback is a usage error.
    pub fn send_msg(&self, payload: &[u8]) {
        {
            let mut inner = self.inner.borrow_mut();
            let ConnInner {
                delivery, output, ..
            } = &mut *inner;
            match delivery {
                Delivery::Framed { codec, .. } => codec.encode(payload, output),
                _ => panic!("send_msg requires a message callback with a codec"),
            }
        }
        flush_output(self);
    }

    /// Close on the owning loop during its next cycle. Safe to call from
    /// callbacks.
    pub fn close(&self) {
        self.handle().close();
    }

    /// Close immediately. Runs the full teardown synchronously, so avoid
    /// calling it from inside this connection's own callbacks; prefer
    /// [`TcpConn::close`] there.
    pub fn close_now(&self) {
        close_source(self);
    }
}

fn attach_fd(conn: &TcpConn, fd: RawFd, local: Addr, peer: Addr) {
    let owner = conn.inner.borrow().owner.clone();
    {
        let mut inner = conn.inner.borrow_mut();
        let ok = (inner.is_client && inner.state == ConnState::Handshaking)
            || (!inner.is_client && inner.state == ConnState::Invalid);
        assert!(ok, "attach on a connection in state {:?}", inner.state);
        inner.state = ConnState::Handshaking;
        inner.local = local;
        inner.peer = peer;
    }
    let source = match EventSource::new(&owner, fd, true, true) {
        Ok(source) => source,
        Err(e) => {
            error!(fd, error = %e, "failed to register connection descriptor");
            unsafe {
                libc::close(fd);
            }
            cleanup(conn);
            return;
        }
    };
    {
        let c = conn.clone();
        source.set_read_callback(move || handle_read(&c));
    }
    {
        let c = conn.clone();
        source.set_write_callback(move || handle_write(&c));
    }
    trace!(fd, local = %local, peer = %peer, "connection attached");
    conn.inner.borrow_mut().source = Some(source);
    owner.register_conn(conn);
    metrics::CONNECTIONS_ACTIVE.increment();
}

fn start_connect(conn: &TcpConn, host: &str, port: u16, timeout_ms: u64, local_ip: &str) {
    let owner = conn.inner.borrow().owner.clone();
    {
        let mut inner = conn.inner.borrow_mut();
        assert!(
            matches!(
                inner.state,
                ConnState::Invalid | ConnState::Closed | ConnState::Failed
            ),
            "connect on a connection in state {:?}",
            inner.state
        );
        inner.is_client = true;
        inner.dest_host = host.to_string();
        inner.dest_port = port;
        inner.local_ip = local_ip.to_string();
        inner.connect_timeout = timeout_ms;
        inner.connected_time = clock::now_ms();
        inner.state = ConnState::Handshaking;
    }

    let peer = Addr::resolve(host, port);
    let sock = match Socket::new(Domain::IPV4, Type::STREAM, None) {
        Ok(sock) => sock,
        Err(e) => {
            error!(error = %e, "socket creation failed");
            cleanup(conn);
            return;
        }
    };
    if let Err(e) = sock.set_nonblocking(true) {
        error!(error = %e, "set_nonblocking failed");
    }

    let mut pre_failed = false;
    if !local_ip.is_empty() {
        match Addr::resolve(local_ip, 0).socket_addr() {
            Some(sa) => {
                if let Err(e) = sock.bind(&SockAddr::from(SocketAddr::V4(sa))) {
                    error!(local_ip, error = %e, "bind to local address failed");
                    pre_failed = true;
                }
            }
            None => {
                error!(local_ip, "local address resolution failed");
                pre_failed = true;
            }
        }
    }
    if !pre_failed {
        match peer.socket_addr() {
            Some(sa) => {
                if let Err(e) = sock.connect(&SockAddr::from(SocketAddr::V4(sa))) {
                    if e.raw_os_error() != Some(libc::EINPROGRESS) {
                        error!(peer = %peer, error = %e, "connect failed");
                    }
                }
            }
            // An unresolvable peer still goes through the handshake path so
            // the failure surfaces via the state callback (and reconnect).
            None => error!(host, port, "peer resolution failed"),
        }
    }

    let fd = sock.into_raw_fd();
    let local = Addr::from_local_fd(fd);
    attach_fd(conn, fd, local, peer);

    if timeout_ms > 0 && conn.state() == ConnState::Handshaking {
        let c = conn.clone();
        let tid = owner.schedule_after(timeout_ms, move |_| {
            if c.state() == ConnState::Handshaking {
                debug!(conn_id = c.id(), "connect timed out");
                close_source(&c);
            }
        });
        conn.inner.borrow_mut().timeout_timer = Some(tid);
    }
}

/// Close the live source, if any. The source's close invokes the read
/// handler, which drives the shared cleanup path.
fn close_source(conn: &TcpConn) {
    let source = conn.inner.borrow().source.clone();
    if let Some(source) = source {
        source.close();
    }
}

pub(crate) fn handle_read(conn: &TcpConn) {
    if conn.state() == ConnState::Handshaking && !handle_handshake(conn) {
        return;
    }
    loop {
        let fd = {
            let inner = conn.inner.borrow();
            if inner.state != ConnState::Connected {
                return;
            }
            match &inner.source {
                Some(s) if !s.is_closed() => s.fd(),
                _ => -1,
            }
        };
        if fd < 0 {
            cleanup(conn);
            return;
        }
        let r = {
            let mut inner = conn.inner.borrow_mut();
            inner.input.ensure_chunk();
            let spare = inner.input.spare_mut();
            let n = unsafe { libc::read(fd, spare.as_mut_ptr().cast(), spare.len()) };
            if n > 0 {
                inner.input.add_len(n as usize);
            }
            n
        };
        if r > 0 {
            metrics::BYTES_RECEIVED.add(r as u64);
            continue;
        }
        if r == 0 {
            // peer closed
            cleanup(conn);
            return;
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => {
                refresh_idle_watches(conn);
                deliver_input(conn);
                return;
            }
            _ => {
                debug!(fd, error = %err, "read failed");
                cleanup(conn);
                return;
            }
        }
    }
}

pub(crate) fn handle_write(conn: &TcpConn) {
    match conn.state() {
        ConnState::Handshaking => {
            handle_handshake(conn);
        }
        ConnState::Connected => {
            flush_output(conn);
            if conn.inner.borrow().output.is_empty() {
                fire_drained_cb(conn);
            }
            // the drained callback may have written more
            if conn.inner.borrow().output.is_empty() {
                let source = conn.inner.borrow().source.clone();
                if let Some(s) = source {
                    if s.write_enabled() {
                        s.enable_write(false);
                    }
                }
            }
        }
        state => debug!(?state, "write event in unexpected state"),
    }
}

/// Confirm an in-progress connect: writable-readiness alone is not enough,
/// since a failed connect also becomes writable; the socket's pending-error
/// status decides. Returns false when the connection was cleaned up.
fn handle_handshake(conn: &TcpConn) -> bool {
    let fd = {
        let inner = conn.inner.borrow();
        assert!(
            inner.state == ConnState::Handshaking,
            "handshake in state {:?}",
            inner.state
        );
        match &inner.source {
            Some(s) if !s.is_closed() => s.fd(),
            _ => -1,
        }
    };
    if fd < 0 {
        cleanup(conn);
        return false;
    }

    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT | libc::POLLERR,
        revents: 0,
    };
    let r = unsafe { libc::poll(&mut pfd, 1, 0) };
    let mut soerr: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let gr = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut soerr as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };

    if r == 1 && pfd.revents == libc::POLLOUT && gr == 0 && soerr == 0 {
        let write_pending = {
            let mut inner = conn.inner.borrow_mut();
            inner.state = ConnState::Connected;
            inner.connected_time = clock::now_ms();
            !inner.output.is_empty()
        };
        let source = conn.inner.borrow().source.clone();
        if let Some(s) = source {
            s.enable_read_write(true, write_pending);
        }
        trace!(fd, peer = %conn.peer_addr(), "connection established");
        fire_state_cb(conn);
        true
    } else {
        trace!(fd, revents = pfd.revents, soerr, "handshake failed");
        cleanup(conn);
        false
    }
}

/// Write until the OS would block. The unsent remainder is the caller's to
/// keep; write interest is enabled when the socket pushes back.
fn isend(conn: &TcpConn, data: &[u8]) -> usize {
    let mut sent = 0;
    while sent < data.len() {
        let fd = {
            let inner = conn.inner.borrow();
            match &inner.source {
                Some(s) if !s.is_closed() => s.fd(),
                _ => -1,
            }
        };
        if fd < 0 {
            warn!("write on a closed connection");
            break;
        }
        let n = unsafe {
            libc::write(
                fd,
                data[sent..].as_ptr().cast(),
                data.len() - sent,
            )
        };
        if n > 0 {
            sent += n as usize;
            metrics::BYTES_SENT.add(n as u64);
            continue;
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => {
                let source = conn.inner.borrow().source.clone();
                if let Some(s) = source {
                    if !s.write_enabled() {
                        s.enable_write(true);
                    }
                }
                break;
            }
            _ => {
                error!(fd, error = %err, "write failed");
                break;
            }
        }
    }
    sent
}

/// Push pending output to the socket, retaining only the remainder.
fn flush_output(conn: &TcpConn) {
    let mut out = mem::take(&mut conn.inner.borrow_mut().output);
    if !out.is_empty() {
        let sent = isend(conn, out.data());
        out.consume(sent);
    }
    let mut inner = conn.inner.borrow_mut();
    // bytes queued while the buffer was detached stay ordered behind it
    out.absorb(&mut inner.output);
    inner.output = out;
}

fn refresh_idle_watches(conn: &TcpConn) {
    let ids = conn.inner.borrow().idle_ids.clone();
    if ids.is_empty() {
        return;
    }
    let owner = conn.inner.borrow().owner.clone();
    for id in &ids {
        owner.touch_idle(id);
    }
}

/// Hand accumulated input to the application: the raw callback sees the
/// buffer, the framed path loop-decodes complete messages. A decode error
/// closes the connection immediately.
fn deliver_input(conn: &TcpConn) {
    let mut delivery = {
        let mut inner = conn.inner.borrow_mut();
        if inner.input.is_empty() || matches!(inner.delivery, Delivery::None) {
            return;
        }
        mem::replace(&mut inner.delivery, Delivery::None)
    };

    match &mut delivery {
        Delivery::None => {}
        Delivery::Raw(cb) => {
            let mut input = mem::take(&mut conn.inner.borrow_mut().input);
            cb(conn, &mut input);
            let mut inner = conn.inner.borrow_mut();
            input.absorb(&mut inner.input);
            inner.input = input;
        }
        Delivery::Framed { codec, on_msg } => loop {
            {
                let inner = conn.inner.borrow();
                let live = matches!(
                    inner.state,
                    ConnState::Handshaking | ConnState::Connected
                );
                if !live || inner.input.is_empty() {
                    break;
                }
            }
            let decoded = {
                let inner = conn.inner.borrow();
                codec.try_decode(inner.input.data())
            };
            match decoded {
                Ok(None) => break,
                Ok(Some(frame)) => {
                    let msg = {
                        let mut inner = conn.inner.borrow_mut();
                        let msg = inner.input.data()[frame.payload.clone()].to_vec();
                        inner.input.consume(frame.consumed);
                        msg
                    };
                    trace!(consumed = frame.consumed, len = msg.len(), "message decoded");
                    on_msg(conn, &msg);
                }
                Err(e) => {
                    warn!(error = %e, "protocol decode failed, closing connection");
                    close_source(conn);
                    break;
                }
            }
        },
    }

    // Re-install unless the connection was torn down for good while a
    // callback ran.
    let mut inner = conn.inner.borrow_mut();
    let terminal =
        matches!(inner.state, ConnState::Closed | ConnState::Failed) && !inner.parked;
    if !terminal && matches!(inner.delivery, Delivery::None) {
        inner.delivery = delivery;
    }
}

fn fire_state_cb(conn: &TcpConn) {
    let cb = conn.inner.borrow_mut().state_cb.take();
    if let Some(mut cb) = cb {
        cb(conn);
        let mut inner = conn.inner.borrow_mut();
        let terminal =
            matches!(inner.state, ConnState::Closed | ConnState::Failed) && !inner.parked;
        if !terminal && inner.state_cb.is_none() {
            inner.state_cb = Some(cb);
        }
    }
}

fn fire_drained_cb(conn: &TcpConn) {
    let cb = conn.inner.borrow_mut().drained_cb.take();
    if let Some(mut cb) = cb {
        cb(conn);
        let mut inner = conn.inner.borrow_mut();
        let terminal =
            matches!(inner.state, ConnState::Closed | ConnState::Failed) && !inner.parked;
        if !terminal && inner.drained_cb.is_none() {
            inner.drained_cb = Some(cb);
        }
    }
}

/// Shared teardown for handshake failure and post-connect close: flush
/// trailing input best-effort, transition state, cancel the connect timer,
/// notify, then either schedule a reconnect (the object survives) or release
/// everything.
pub(crate) fn cleanup(conn: &TcpConn) {
    {
        let mut inner = conn.inner.borrow_mut();
        if inner.cleaning {
            return;
        }
        let eligible = matches!(
            inner.state,
            ConnState::Handshaking | ConnState::Connected
        ) || inner.parked;
        if !eligible {
            return;
        }
        inner.cleaning = true;
        inner.parked = false;
    }

    // give the application a last chance to see trailing data
    deliver_input(conn);

    let owner = conn.inner.borrow().owner.clone();
    let (had_source, timeout_timer) = {
        let mut inner = conn.inner.borrow_mut();
        inner.state = if inner.state == ConnState::Handshaking {
            ConnState::Failed
        } else {
            ConnState::Closed
        };
        (inner.source.is_some(), inner.timeout_timer.take())
    };
    if let Some(tid) = timeout_timer {
        owner.cancel(tid);
    }
    if had_source {
        metrics::CONNECTIONS_ACTIVE.decrement();
    }
    trace!(conn_id = conn.id(), state = ?conn.state(), peer = %conn.peer_addr(), "connection closing");

    let will_reconnect = {
        let inner = conn.inner.borrow();
        inner.reconnect_interval >= 0 && !owner.is_exiting()
    };
    conn.inner.borrow_mut().parked = will_reconnect;
    fire_state_cb(conn);

    if will_reconnect {
        schedule_reconnect(conn, &owner);
        conn.inner.borrow_mut().cleaning = false;
        return;
    }

    let (idle_ids, source) = {
        let mut inner = conn.inner.borrow_mut();
        inner.delivery = Delivery::None;
        inner.state_cb = None;
        inner.drained_cb = None;
        (mem::take(&mut inner.idle_ids), inner.source.take())
    };
    for id in &idle_ids {
        owner.unregister_idle(id);
    }
    // fires the read callback once; the state is terminal so it no-ops
    drop(source);
    owner.unpark_reconnect(conn.id());
    owner.remove_conn(conn.id());
    conn.inner.borrow_mut().cleaning = false;
}

/// Park the connection and schedule a fresh connect attempt, measured from
/// the previous connect time and clamped to run no earlier than now.
fn schedule_reconnect(conn: &TcpConn, owner: &EventLoop) {
    owner.park_reconnect(conn);
    let wait = {
        let inner = conn.inner.borrow();
        let elapsed = clock::now_ms().saturating_sub(inner.connected_time);
        (inner.reconnect_interval as u64).saturating_sub(elapsed)
    };
    info!(conn_id = conn.id(), wait_ms = wait, "reconnect scheduled");
    metrics::RECONNECTS_SCHEDULED.increment();
    // take the source out before dropping it: its close re-enters the
    // connection through the read callback
    let source = conn.inner.borrow_mut().source.take();
    drop(source);

    let c = conn.clone();
    owner.schedule_after(wait, move |l| {
        l.unpark_reconnect(c.id());
        c.inner.borrow_mut().parked = false;
        let (host, port, timeout, local_ip) = {
            let inner = c.inner.borrow();
            (
                inner.dest_host.clone(),
                inner.dest_port,
                inner.connect_timeout,
                inner.local_ip.clone(),
            )
        };
        start_connect(&c, &host, port, timeout, &local_ip);
    });
}
