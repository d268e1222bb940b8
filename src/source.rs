//! Per-descriptor registration unit.
//!
//! An `EventSource` binds one readiness-capable descriptor to read/write
//! callbacks and belongs to exactly one event loop for its whole life. It
//! knows its own interest set but delegates registration to the loop's
//! poller. It must deregister before the descriptor is closed, which
//! [`EventSource::close`] guarantees.

use std::cell::Cell;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;

use tracing::trace;

use crate::event_loop::EventLoop;
use crate::poller::SourceId;

struct SourceInner {
    owner: EventLoop,
    id: SourceId,
    fd: Cell<RawFd>,
    closed: Cell<bool>,
}

/// Cheap handle to a registered source. Clones refer to the same
/// registration; the registration is released when the last clone drops.
#[derive(Clone)]
pub struct EventSource {
    inner: Rc<SourceInner>,
}

impl EventSource {
    /// Bind `fd` to `owner`'s poller with the given initial interest. The
    /// descriptor is switched to non-blocking mode and is owned by the
    /// source from here on.
    pub fn new(owner: &EventLoop, fd: RawFd, read: bool, write: bool) -> io::Result<EventSource> {
        set_nonblocking(fd)?;
        let id = owner.with_poller(|p| p.add_source(fd, read, write))?;
        Ok(EventSource {
            inner: Rc::new(SourceInner {
                owner: owner.clone(),
                id,
                fd: Cell::new(fd),
                closed: Cell::new(false),
            }),
        })
    }

    pub fn set_read_callback(&self, cb: impl Fn() + 'static) {
        let id = self.inner.id;
        self.inner
            .owner
            .with_poller(|p| p.set_read_callback(id, Rc::new(cb)));
    }

    pub fn set_write_callback(&self, cb: impl Fn() + 'static) {
        let id = self.inner.id;
        self.inner
            .owner
            .with_poller(|p| p.set_write_callback(id, Rc::new(cb)));
    }

    pub fn enable_read(&self, on: bool) {
        self.update_interest(Some(on), None);
    }

    pub fn enable_write(&self, on: bool) {
        self.update_interest(None, Some(on));
    }

    pub fn enable_read_write(&self, read: bool, write: bool) {
        self.update_interest(Some(read), Some(write));
    }

    pub fn read_enabled(&self) -> bool {
        let id = self.inner.id;
        self.inner.owner.with_poller(|p| p.read_enabled(id))
    }

    pub fn write_enabled(&self) -> bool {
        let id = self.inner.id;
        self.inner.owner.with_poller(|p| p.write_enabled(id))
    }

    /// The underlying descriptor, or -1 once closed.
    pub fn fd(&self) -> RawFd {
        self.inner.fd.get()
    }

    pub fn id(&self) -> SourceId {
        self.inner.id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Idempotent teardown: deregister from the poller, close the
    /// descriptor, then synchronously invoke the read callback once more so
    /// the owner observes end-of-stream. This is the only path by which a
    /// connection learns its peer is gone.
    pub fn close(&self) {
        self.inner.close();
    }

    fn update_interest(&self, read: Option<bool>, write: Option<bool>) {
        if self.inner.closed.get() {
            return;
        }
        let id = self.inner.id;
        let r = self.inner.owner.with_poller(|p| {
            let read = read.unwrap_or_else(|| p.read_enabled(id));
            let write = write.unwrap_or_else(|| p.write_enabled(id));
            p.update_source(id, read, write)
        });
        if let Err(e) = r {
            // An interest update can only fail if the descriptor is gone
            // underneath us, which is an ownership violation.
            panic!("interest update failed for fd {}: {e}", self.fd());
        }
    }
}

impl SourceInner {
    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        let fd = self.fd.replace(-1);
        trace!(fd, index = self.id.index(), "closing source");
        let read_cb = self.owner.with_poller(|p| {
            let cb = p.read_cb(self.id.index(), self.id.generation());
            p.remove_source(self.id);
            cb
        });
        if fd >= 0 {
            unsafe {
                libc::close(fd);
            }
        }
        if let Some(cb) = read_cb {
            cb();
        }
    }
}

impl Drop for SourceInner {
    fn drop(&mut self) {
        self.close();
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
