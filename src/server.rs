//! TCP listener: bind, batch-drain accept, and distribution of accepted
//! connections across a loop pool.
//!
//! Socket setup happens synchronously in [`ServerBuilder::start`] so bind
//! conflicts surface as an error; the accept source is installed on the
//! first loop the allocator yields. Each accepted descriptor is handed to a
//! round-robin-chosen loop — constructed inline when that loop is the
//! acceptor's own, marshaled through the target loop's task queue otherwise,
//! because a connection's source registration must happen on the thread
//! that will service it.

use std::net::{SocketAddr, SocketAddrV4};
use std::os::fd::{IntoRawFd, RawFd};
use std::sync::Arc;

use socket2::{Domain, SockAddr, Socket, Type};
use tracing::{error, info, trace, warn};

use crate::addr::Addr;
use crate::buffer::Buffer;
use crate::codec::Codec;
use crate::conn::TcpConn;
use crate::error::Error;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::group::LoopAllocator;
use crate::metrics;
use crate::source::EventSource;

const DEFAULT_BACKLOG: i32 = 128;

type InitCb = Arc<dyn Fn(&TcpConn) + Send + Sync>;
type StateCb = Arc<dyn Fn(&TcpConn) + Send + Sync>;
type ReadCb = Arc<dyn Fn(&TcpConn, &mut Buffer) + Send + Sync>;
type MsgCb = Arc<dyn Fn(&TcpConn, &[u8]) + Send + Sync>;

/// Per-connection wiring shared by every loop that adopts an accepted
/// descriptor. The codec is cloned per connection, never shared.
struct ConnCallbacks {
    init: Option<InitCb>,
    state: Option<StateCb>,
    read: Option<ReadCb>,
    msg: Option<(Box<dyn Codec>, MsgCb)>,
}

/// Builder for a listening server.
pub struct ServerBuilder {
    host: String,
    port: u16,
    reuse_port: bool,
    backlog: i32,
    callbacks: ConnCallbacks,
}

impl ServerBuilder {
    pub fn new(host: &str, port: u16) -> ServerBuilder {
        ServerBuilder {
            host: host.to_string(),
            port,
            reuse_port: false,
            backlog: DEFAULT_BACKLOG,
            callbacks: ConnCallbacks {
                init: None,
                state: None,
                read: None,
                msg: None,
            },
        }
    }

    /// Enable SO_REUSEPORT so several processes can share the port.
    pub fn reuse_port(mut self, on: bool) -> ServerBuilder {
        self.reuse_port = on;
        self
    }

    pub fn backlog(mut self, backlog: i32) -> ServerBuilder {
        self.backlog = backlog;
        self
    }

    /// Run once per accepted connection, on its owning loop, after the
    /// other callbacks are installed. Use for per-connection setup such as
    /// idle watches.
    pub fn conn_init(mut self, f: impl Fn(&TcpConn) + Send + Sync + 'static) -> ServerBuilder {
        self.callbacks.init = Some(Arc::new(f));
        self
    }

    pub fn conn_state(mut self, f: impl Fn(&TcpConn) + Send + Sync + 'static) -> ServerBuilder {
        self.callbacks.state = Some(Arc::new(f));
        self
    }

    /// Raw-byte delivery for every accepted connection. Conflicts with
    /// [`ServerBuilder::conn_msg`].
    pub fn conn_read(
        mut self,
        f: impl Fn(&TcpConn, &mut Buffer) + Send + Sync + 'static,
    ) -> ServerBuilder {
        assert!(
            self.callbacks.msg.is_none(),
            "read callback conflicts with an installed message callback"
        );
        self.callbacks.read = Some(Arc::new(f));
        self
    }

    /// Framed-message delivery for every accepted connection. Conflicts
    /// with [`ServerBuilder::conn_read`].
    pub fn conn_msg(
        mut self,
        codec: Box<dyn Codec>,
        f: impl Fn(&TcpConn, &[u8]) + Send + Sync + 'static,
    ) -> ServerBuilder {
        assert!(
            self.callbacks.read.is_none(),
            "message callback conflicts with an installed read callback"
        );
        self.callbacks.msg = Some((codec, Arc::new(f)));
        self
    }

    /// Bind, listen, and install the acceptor on the first allocated loop.
    pub fn start(self, alloc: &LoopAllocator) -> Result<TcpServer, Error> {
        let addr = Addr::resolve(&self.host, self.port);
        let Some(bind_addr) = addr.socket_addr() else {
            return Err(Error::Resolve(format!("{}:{}", self.host, self.port)));
        };

        let sock = Socket::new(Domain::IPV4, Type::STREAM, None)?;
        sock.set_reuse_address(true)?;
        if self.reuse_port {
            sock.set_reuse_port(true)?;
        }
        sock.bind(&SockAddr::from(SocketAddr::V4(bind_addr)))
            .map_err(|e| Error::Bind {
                addr: addr.to_string(),
                source: e,
            })?;
        sock.listen(self.backlog)?;
        sock.set_nonblocking(true)?;
        let local = sock
            .local_addr()?
            .as_socket()
            .unwrap_or(SocketAddr::V4(SocketAddrV4::new(
                std::net::Ipv4Addr::UNSPECIFIED,
                0,
            )));

        let acceptor_loop = alloc.allocate();
        let allocator = alloc.clone();
        let callbacks = Arc::new(self.callbacks);
        let fd = sock.into_raw_fd();
        let posted = acceptor_loop.post(move |l| {
            install_acceptor(l, fd, allocator, callbacks);
        });
        if !posted {
            unsafe {
                libc::close(fd);
            }
            return Err(Error::LoopUnavailable);
        }

        info!(addr = %local, "listening");
        Ok(TcpServer {
            addr: local,
            acceptor: acceptor_loop,
        })
    }
}

/// Handle to a running listener. The listener itself lives on its loop for
/// the lifetime of the server.
pub struct TcpServer {
    addr: SocketAddr,
    acceptor: LoopHandle,
}

impl TcpServer {
    /// The bound address; with port 0 this carries the assigned port.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.acceptor
    }
}

fn install_acceptor(l: &EventLoop, fd: RawFd, allocator: LoopAllocator, cbs: Arc<ConnCallbacks>) {
    match EventSource::new(l, fd, true, false) {
        Ok(source) => {
            let own = l.clone();
            // the callback keeps the source alive for the loop's lifetime
            let src = source.clone();
            source.set_read_callback(move || handle_accept(&own, &src, &allocator, &cbs));
        }
        Err(e) => {
            error!(fd, error = %e, "failed to register acceptor");
            unsafe {
                libc::close(fd);
            }
        }
    }
}

/// Drain the backlog: accept until the call would block, handing each
/// descriptor to a loop chosen round-robin.
fn handle_accept(l: &EventLoop, src: &EventSource, allocator: &LoopAllocator, cbs: &Arc<ConnCallbacks>) {
    let lfd = src.fd();
    if lfd < 0 {
        return;
    }
    loop {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let cfd = unsafe {
            libc::accept4(
                lfd,
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_CLOEXEC,
            )
        };
        if cfd < 0 {
            let err = std::io::Error::last_os_error();
            match err.kind() {
                std::io::ErrorKind::WouldBlock => break,
                std::io::ErrorKind::Interrupted => continue,
                _ => {
                    warn!(error = %err, "accept failed");
                    break;
                }
            }
        }
        let peer = Addr::from_storage(&storage);
        let local = Addr::from_local_fd(cfd);
        metrics::CONNECTIONS_ACCEPTED.increment();
        trace!(cfd, peer = %peer, "accepted");

        let target = allocator.allocate();
        if target.id() == l.id() {
            add_conn(l, cfd, local, peer, cbs);
        } else {
            let cbs = cbs.clone();
            let posted = target.post(move |tl| add_conn(tl, cfd, local, peer, &cbs));
            if !posted {
                warn!(cfd, "target loop rejected connection");
                unsafe {
                    libc::close(cfd);
                }
            }
        }
    }
}

/// Build the connection on its owning loop and wire the per-connection
/// callbacks.
fn add_conn(l: &EventLoop, fd: RawFd, local: Addr, peer: Addr, cbs: &Arc<ConnCallbacks>) {
    let conn = TcpConn::attach(l, fd, local, peer);
    if let Some(state) = &cbs.state {
        let cb = state.clone();
        conn.set_state_callback(move |c| cb(c));
    }
    if let Some(read) = &cbs.read {
        let cb = read.clone();
        conn.set_read_callback(move |c, buf| cb(c, buf));
    }
    if let Some((codec, msg)) = &cbs.msg {
        let cb = msg.clone();
        conn.set_message_callback(codec.clone_box(), move |c, payload| cb(c, payload));
    }
    if let Some(init) = &cbs.init {
        init(&conn);
    }
}
