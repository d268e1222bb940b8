//! Readiness multiplexer over mio's `Poll` (epoll on Linux).
//!
//! The poller owns no descriptors, only interest registrations. Registered
//! sources live in a slab arena; the ready batch produced by each wait cycle
//! stores arena indices plus a generation tag, so a source removed from
//! within the dispatch of an earlier record in the same batch resolves to a
//! guaranteed no-op lookup instead of a stale reference.

use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use tracing::trace;

/// Token reserved for the loop's wakeup facility; arena indices stay below it.
pub(crate) const WAKER_TOKEN: Token = Token(1 << 31);

/// Stable identifier for a registered source. The generation tag detects
/// reuse of an arena slot after removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceId {
    index: u32,
    generation: u32,
}

impl SourceId {
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }
}

struct SourceEntry {
    fd: RawFd,
    generation: u32,
    read_on: bool,
    write_on: bool,
    /// Whether the descriptor is currently registered with the OS facility.
    /// Interest may drop to nothing, which epoll expresses as deregistration.
    registered: bool,
    read_cb: Option<Rc<dyn Fn()>>,
    write_cb: Option<Rc<dyn Fn()>>,
}

/// One ready-event record from the most recent wait cycle.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Ready {
    /// The loop's wakeup descriptor fired; drain the cross-thread inbox.
    Wakeup,
    Source {
        index: usize,
        generation: u32,
        readable: bool,
        writable: bool,
    },
}

/// Wraps the readiness facility plus the live-source arena.
pub struct Poller {
    poll: Poll,
    events: Events,
    sources: Slab<SourceEntry>,
    next_generation: u32,
    batch: Vec<Ready>,
}

impl Poller {
    pub(crate) fn from_poll(poll: Poll) -> Poller {
        Poller {
            poll,
            events: Events::with_capacity(1024),
            sources: Slab::new(),
            next_generation: 0,
            batch: Vec::with_capacity(1024),
        }
    }

    /// Register a descriptor with the given initial interest.
    pub fn add_source(&mut self, fd: RawFd, read: bool, write: bool) -> io::Result<SourceId> {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);

        let entry = self.sources.vacant_entry();
        let index = entry.key();
        assert!(index < WAKER_TOKEN.0, "source arena exhausted");

        let mut registered = false;
        if let Some(interest) = interest_of(read, write) {
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), Token(index), interest)?;
            registered = true;
        }

        entry.insert(SourceEntry {
            fd,
            generation,
            read_on: read,
            write_on: write,
            registered,
            read_cb: None,
            write_cb: None,
        });

        trace!(index, fd, read, write, "source added");
        Ok(SourceId {
            index: index as u32,
            generation,
        })
    }

    /// Remove a source's registration. Any record for it still pending in the
    /// current ready batch is nulled out, since removal may happen from
    /// within the dispatch of an earlier record in the same batch.
    pub fn remove_source(&mut self, id: SourceId) {
        let index = id.index();
        let live = matches!(self.sources.get(index), Some(e) if e.generation == id.generation);
        if !live {
            return;
        }
        let entry = self.sources.remove(index);
        if entry.registered {
            if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&entry.fd)) {
                trace!(index, fd = entry.fd, error = %e, "deregister failed");
            }
        }
        self.batch.retain(|r| {
            !matches!(r, Ready::Source { index: i, generation: g, .. }
                if *i == index && *g == id.generation)
        });
        trace!(index, fd = entry.fd, "source removed");
    }

    /// Push an interest change down to the OS facility.
    pub fn update_source(&mut self, id: SourceId, read: bool, write: bool) -> io::Result<()> {
        let index = id.index();
        let entry = match self.sources.get_mut(index) {
            Some(e) if e.generation == id.generation => e,
            _ => return Ok(()),
        };
        entry.read_on = read;
        entry.write_on = write;
        let registry = self.poll.registry();
        match (interest_of(read, write), entry.registered) {
            (Some(interest), true) => {
                registry.reregister(&mut SourceFd(&entry.fd), Token(index), interest)?
            }
            (Some(interest), false) => {
                registry.register(&mut SourceFd(&entry.fd), Token(index), interest)?;
                entry.registered = true;
            }
            (None, true) => {
                registry.deregister(&mut SourceFd(&entry.fd))?;
                entry.registered = false;
            }
            (None, false) => {}
        }
        Ok(())
    }

    pub fn set_read_callback(&mut self, id: SourceId, cb: Rc<dyn Fn()>) {
        if let Some(e) = self.entry_mut(id) {
            e.read_cb = Some(cb);
        }
    }

    pub fn set_write_callback(&mut self, id: SourceId, cb: Rc<dyn Fn()>) {
        if let Some(e) = self.entry_mut(id) {
            e.write_cb = Some(cb);
        }
    }

    pub fn read_enabled(&self, id: SourceId) -> bool {
        self.entry(id).map(|e| e.read_on).unwrap_or(false)
    }

    pub fn write_enabled(&self, id: SourceId) -> bool {
        self.entry(id).map(|e| e.write_on).unwrap_or(false)
    }

    pub fn contains(&self, id: SourceId) -> bool {
        self.entry(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Block for readiness and capture the ready batch. Returns the number of
    /// records captured. An interrupted wait counts as an empty cycle.
    pub fn wait_once(&mut self, timeout: Duration) -> io::Result<usize> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }

        // Collect event info first to avoid borrow issues.
        let collected: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|e| {
                (
                    e.token(),
                    e.is_readable() || e.is_error() || e.is_read_closed(),
                    e.is_writable() || e.is_write_closed(),
                )
            })
            .collect();

        self.batch.clear();
        for (token, readable, writable) in collected {
            if token == WAKER_TOKEN {
                self.batch.push(Ready::Wakeup);
                continue;
            }
            let index = token.0;
            let generation = match self.sources.get(index) {
                Some(e) => e.generation,
                None => {
                    trace!(index, "event for vacated source slot");
                    continue;
                }
            };
            if !readable && !writable {
                panic!("unexpected poller events for source {index}");
            }
            self.batch.push(Ready::Source {
                index,
                generation,
                readable,
                writable,
            });
        }
        Ok(self.batch.len())
    }

    /// Pop the next record of the current batch, most recent first.
    pub(crate) fn next_ready(&mut self) -> Option<Ready> {
        self.batch.pop()
    }

    pub(crate) fn read_cb(&self, index: usize, generation: u32) -> Option<Rc<dyn Fn()>> {
        self.sources
            .get(index)
            .filter(|e| e.generation == generation)
            .and_then(|e| e.read_cb.clone())
    }

    pub(crate) fn write_cb(&self, index: usize, generation: u32) -> Option<Rc<dyn Fn()>> {
        self.sources
            .get(index)
            .filter(|e| e.generation == generation)
            .and_then(|e| e.write_cb.clone())
    }

    /// Detach every registered callback. The caller drops the returned
    /// closures outside the poller borrow, since a callback's captures may
    /// release sources that re-enter the poller on teardown.
    pub(crate) fn take_callbacks(&mut self) -> Vec<Rc<dyn Fn()>> {
        let mut cbs = Vec::new();
        for (_, entry) in self.sources.iter_mut() {
            if let Some(cb) = entry.read_cb.take() {
                cbs.push(cb);
            }
            if let Some(cb) = entry.write_cb.take() {
                cbs.push(cb);
            }
        }
        cbs
    }

    fn entry(&self, id: SourceId) -> Option<&SourceEntry> {
        self.sources
            .get(id.index())
            .filter(|e| e.generation == id.generation)
    }

    fn entry_mut(&mut self, id: SourceId) -> Option<&mut SourceEntry> {
        self.sources
            .get_mut(id.index())
            .filter(|e| e.generation == id.generation)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        for (_, entry) in self.sources.iter() {
            if entry.fd >= 0 {
                unsafe {
                    libc::close(entry.fd);
                }
            }
        }
    }
}

fn interest_of(read: bool, write: bool) -> Option<Interest> {
    match (read, write) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}
