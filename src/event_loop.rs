//! The reactor: one multiplexer wait/dispatch cycle run in a loop, plus
//! timers, idle-connection expiry, and a cross-thread task inbox.
//!
//! One loop runs per thread. All state belonging to a loop — its sources,
//! timers, idle registry, and every connection registered on it — is mutated
//! only by that thread, which the handle types enforce: [`EventLoop`] is not
//! `Send`, while [`LoopHandle`] is the thread-safe face whose only entry
//! points are posting work and requesting exit.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::mem;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::{Poll, Waker};
use tracing::{debug, trace, warn};

use crate::clock;
use crate::conn::TcpConn;
use crate::metrics;
use crate::poller::{Poller, Ready, WAKER_TOKEN};
use crate::queue::TaskQueue;

/// Work marshaled onto a loop from any thread.
pub(crate) type LoopTask = Box<dyn FnOnce(&EventLoop) + Send>;

/// Cancellation handle for a scheduled timer: fire time in loop-clock
/// milliseconds, tie-broken by insertion sequence.
pub type TimerId = (u64, u64);

const INVALID_TIMER: TimerId = (0, 0);

/// Wait bound when no timer is pending; large enough to mean "no bound".
const NO_TIMER_WAIT_MS: u64 = 1 << 30;

static NEXT_LOOP_ID: AtomicUsize = AtomicUsize::new(0);

enum TimerEntry {
    Once(Box<dyn FnOnce(&EventLoop)>),
    Repeat {
        interval: u64,
        task: Rc<dyn Fn(&EventLoop)>,
    },
}

/// Handle for an idle watch registration.
#[derive(Debug, Clone)]
pub struct IdleId {
    threshold: u64,
    node: u64,
}

struct IdleNode {
    node: u64,
    conn: TcpConn,
    last_active: u64,
    cb: Rc<dyn Fn(&TcpConn)>,
}

/// The pre-thread half of an event loop. Seeds are `Send`, so a
/// [`crate::group::LoopGroup`] can create them eagerly and assemble the loop
/// itself on the thread that will run it.
pub struct LoopSeed {
    id: usize,
    poll: Poll,
    waker: Arc<Waker>,
    tasks: Arc<TaskQueue<LoopTask>>,
    exited: Arc<AtomicBool>,
}

impl LoopSeed {
    /// Create the OS facilities for a loop. `task_capacity` bounds the
    /// cross-thread inbox; 0 means unbounded.
    pub fn new(task_capacity: usize) -> io::Result<LoopSeed> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(LoopSeed {
            id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
            poll,
            waker,
            tasks: Arc::new(TaskQueue::new(task_capacity)),
            exited: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            id: self.id,
            tasks: self.tasks.clone(),
            waker: self.waker.clone(),
            exited: self.exited.clone(),
        }
    }
}

/// Thread-safe handle to a loop: the sole cross-thread entry points.
#[derive(Clone)]
pub struct LoopHandle {
    id: usize,
    tasks: Arc<TaskQueue<LoopTask>>,
    waker: Arc<Waker>,
    exited: Arc<AtomicBool>,
}

impl LoopHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Queue a task for execution on the loop's own thread, in submission
    /// order, and wake the loop. Returns false when the inbox is at capacity
    /// or the loop is exiting.
    pub fn post(&self, task: impl FnOnce(&EventLoop) + Send + 'static) -> bool {
        if self.exited.load(Ordering::Acquire) {
            return false;
        }
        if !self.tasks.push(Box::new(task)) {
            return false;
        }
        if let Err(e) = self.waker.wake() {
            warn!(loop_id = self.id, error = %e, "wakeup failed");
        }
        true
    }

    /// Signal the loop to stop after its current cycle.
    pub fn exit(&self) {
        self.exited.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!(loop_id = self.id, error = %e, "wakeup failed");
        }
    }

    pub fn is_exiting(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }
}

pub(crate) struct LoopInner {
    id: usize,
    poller: RefCell<Poller>,
    waker: Arc<Waker>,
    tasks: Arc<TaskQueue<LoopTask>>,
    exited: Arc<AtomicBool>,
    timers: RefCell<BTreeMap<TimerId, TimerEntry>>,
    timer_seq: Cell<u64>,
    idle: RefCell<BTreeMap<u64, VecDeque<IdleNode>>>,
    idle_seq: Cell<u64>,
    idle_scan_installed: Cell<bool>,
    conns: RefCell<HashMap<u64, TcpConn>>,
    reconnects: RefCell<HashMap<u64, TcpConn>>,
}

/// A per-thread reactor. Cheap to clone; clones refer to the same loop.
/// Deliberately not `Send` — a loop's state is confined to its thread.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl EventLoop {
    /// Create a loop owned by the calling thread.
    pub fn new() -> io::Result<EventLoop> {
        Ok(EventLoop::from_seed(LoopSeed::new(0)?))
    }

    /// Assemble a loop from a seed on the thread that will run it.
    pub fn from_seed(seed: LoopSeed) -> EventLoop {
        EventLoop {
            inner: Rc::new(LoopInner {
                id: seed.id,
                poller: RefCell::new(Poller::from_poll(seed.poll)),
                waker: seed.waker,
                tasks: seed.tasks,
                exited: seed.exited,
                timers: RefCell::new(BTreeMap::new()),
                timer_seq: Cell::new(0),
                idle: RefCell::new(BTreeMap::new()),
                idle_seq: Cell::new(0),
                idle_scan_installed: Cell::new(false),
                conns: RefCell::new(HashMap::new()),
                reconnects: RefCell::new(HashMap::new()),
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            id: self.inner.id,
            tasks: self.inner.tasks.clone(),
            waker: self.inner.waker.clone(),
            exited: self.inner.exited.clone(),
        }
    }

    /// An allocator that always yields this loop.
    pub fn allocator(&self) -> crate::group::LoopAllocator {
        crate::group::LoopAllocator::new(vec![self.handle()])
    }

    pub fn is_exiting(&self) -> bool {
        self.inner.exited.load(Ordering::Acquire)
    }

    /// Signal the loop to stop after its current cycle.
    pub fn exit(&self) {
        self.handle().exit();
    }

    /// Run wait/dispatch cycles until exit is requested, then tear down:
    /// cancel all timers, clear the idle registry, force-clean connections
    /// parked in reconnect wait, and run one final zero-wait cycle.
    pub fn run(&self) {
        // Work may have been posted before the loop started.
        self.drain_tasks();
        while !self.is_exiting() {
            self.run_once(10_000);
        }
        // detach before dropping: timer and idle entries hold connection
        // handles whose teardown may re-enter these registries
        let timers = mem::take(&mut *self.inner.timers.borrow_mut());
        drop(timers);
        let idle = mem::take(&mut *self.inner.idle.borrow_mut());
        drop(idle);
        let parked: Vec<TcpConn> = self
            .inner
            .reconnects
            .borrow_mut()
            .drain()
            .map(|(_, c)| c)
            .collect();
        for conn in parked {
            crate::conn::cleanup(&conn);
        }
        // close whatever is still registered, acceptors included
        let live: Vec<TcpConn> = self.inner.conns.borrow().values().cloned().collect();
        for conn in live {
            conn.close_now();
        }
        self.run_once(0);
        let callbacks = self.with_poller(|p| p.take_callbacks());
        drop(callbacks);
        debug!(loop_id = self.inner.id, "loop stopped");
    }

    /// One wait/dispatch cycle bounded by `max_wait_ms` and the next due
    /// timer, followed by firing everything now due.
    pub fn run_once(&self, max_wait_ms: u64) {
        let wait = max_wait_ms.min(self.next_timer_delay_ms());
        let r = self
            .inner
            .poller
            .borrow_mut()
            .wait_once(Duration::from_millis(wait));
        if let Err(e) = r {
            panic!("poller wait failed: {e}");
        }
        loop {
            let record = self.inner.poller.borrow_mut().next_ready();
            let Some(record) = record else { break };
            match record {
                Ready::Wakeup => self.drain_tasks(),
                Ready::Source {
                    index,
                    generation,
                    readable,
                    writable,
                } => {
                    // Write before read, re-resolving in between: a handler
                    // that closes on write-complete must not leave a stale
                    // read dispatch behind.
                    if writable {
                        let cb = self.inner.poller.borrow().write_cb(index, generation);
                        if let Some(cb) = cb {
                            cb();
                        }
                    }
                    if readable {
                        let cb = self.inner.poller.borrow().read_cb(index, generation);
                        if let Some(cb) = cb {
                            cb();
                        }
                    }
                }
            }
        }
        self.handle_timeouts();
    }

    /// Borrow the loop's poller. Only valid on the loop thread; callbacks
    /// must not be invoked while the borrow is held.
    pub(crate) fn with_poller<R>(&self, f: impl FnOnce(&mut Poller) -> R) -> R {
        f(&mut self.inner.poller.borrow_mut())
    }

    /// Queue a task from the loop's own thread or any other, waking the loop.
    pub fn post(&self, task: impl FnOnce(&EventLoop) + Send + 'static) -> bool {
        self.handle().post(task)
    }

    // ---- timers ----

    /// Schedule `task` at an absolute loop-clock time in milliseconds.
    pub fn schedule_at(&self, at_ms: u64, task: impl FnOnce(&EventLoop) + 'static) -> TimerId {
        if self.is_exiting() {
            return INVALID_TIMER;
        }
        let id = (at_ms, self.next_timer_seq());
        self.inner
            .timers
            .borrow_mut()
            .insert(id, TimerEntry::Once(Box::new(task)));
        id
    }

    /// Schedule `task` once, `delay_ms` from now.
    pub fn schedule_after(
        &self,
        delay_ms: u64,
        task: impl FnOnce(&EventLoop) + 'static,
    ) -> TimerId {
        self.schedule_at(clock::now_ms() + delay_ms, task)
    }

    /// Schedule `task` repeatedly: first `delay_ms` from now, then every
    /// `interval_ms` measured from the previous target time, so drift does
    /// not accumulate. A slow handler delays subsequent firings rather than
    /// causing overlap.
    pub fn schedule_every(
        &self,
        delay_ms: u64,
        interval_ms: u64,
        task: impl Fn(&EventLoop) + 'static,
    ) -> TimerId {
        assert!(interval_ms > 0, "repeating timer needs a nonzero interval");
        if self.is_exiting() {
            return INVALID_TIMER;
        }
        let id = (clock::now_ms() + delay_ms, self.next_timer_seq());
        self.inner.timers.borrow_mut().insert(
            id,
            TimerEntry::Repeat {
                interval: interval_ms,
                task: Rc::new(task),
            },
        );
        id
    }

    /// Remove a pending timer. Already-fired or already-cancelled timers
    /// report false, which is not an error.
    pub fn cancel(&self, id: TimerId) -> bool {
        self.inner.timers.borrow_mut().remove(&id).is_some()
    }

    fn next_timer_seq(&self) -> u64 {
        let seq = self.inner.timer_seq.get() + 1;
        self.inner.timer_seq.set(seq);
        seq
    }

    fn next_timer_delay_ms(&self) -> u64 {
        match self.inner.timers.borrow().keys().next() {
            Some(&(at, _)) => at.saturating_sub(clock::now_ms()),
            None => NO_TIMER_WAIT_MS,
        }
    }

    /// Fire all timers now due. The comparison key is captured once per
    /// pass, so a due timer scheduled by a firing handler runs in the same
    /// pass only if already due — no livelock.
    fn handle_timeouts(&self) {
        let limit: TimerId = (clock::now_ms(), u64::MAX);
        loop {
            let due = {
                let mut timers = self.inner.timers.borrow_mut();
                match timers.keys().next() {
                    Some(&key) if key < limit => timers.remove(&key).map(|e| (key, e)),
                    _ => None,
                }
            };
            let Some((key, entry)) = due else { break };
            metrics::TIMERS_FIRED.increment();
            match entry {
                TimerEntry::Once(task) => task(self),
                TimerEntry::Repeat { interval, task } => {
                    let next = (key.0 + interval, self.next_timer_seq());
                    self.inner.timers.borrow_mut().insert(
                        next,
                        TimerEntry::Repeat {
                            interval,
                            task: task.clone(),
                        },
                    );
                    task(self);
                }
            }
        }
    }

    // ---- cross-thread inbox ----

    fn drain_tasks(&self) {
        while let Some(task) = self.inner.tasks.try_pop() {
            task(self);
        }
    }

    // ---- idle registry ----

    /// Watch `conn` for read inactivity. The callback fires each time the
    /// connection has seen no read activity for `seconds`. The first
    /// registration lazily installs a 1-second scan timer.
    pub fn register_idle(
        &self,
        seconds: u64,
        conn: TcpConn,
        cb: Rc<dyn Fn(&TcpConn)>,
    ) -> IdleId {
        assert!(seconds > 0, "idle threshold must be at least one second");
        if !self.inner.idle_scan_installed.replace(true) {
            self.schedule_every(1000, 1000, |l| l.scan_idles());
        }
        let node = self.inner.idle_seq.get() + 1;
        self.inner.idle_seq.set(node);
        self.inner
            .idle
            .borrow_mut()
            .entry(seconds)
            .or_default()
            .push_back(IdleNode {
                node,
                conn,
                last_active: clock::now_secs(),
                cb,
            });
        trace!(seconds, node, "idle watch registered");
        IdleId {
            threshold: seconds,
            node,
        }
    }

    pub fn unregister_idle(&self, id: &IdleId) {
        if let Some(list) = self.inner.idle.borrow_mut().get_mut(&id.threshold) {
            list.retain(|n| n.node != id.node);
        }
    }

    /// Record activity: the entry moves to the back of its threshold's list
    /// with a fresh timestamp, keeping the list ordered oldest-first.
    pub fn touch_idle(&self, id: &IdleId) {
        if let Some(list) = self.inner.idle.borrow_mut().get_mut(&id.threshold) {
            if let Some(pos) = list.iter().position(|n| n.node == id.node) {
                let mut node = list.remove(pos).expect("position just found");
                node.last_active = clock::now_secs();
                list.push_back(node);
            }
        }
    }

    /// Scan each threshold's list from the front, expiring entries whose age
    /// exceeds the threshold and stopping at the first one still fresh.
    fn scan_idles(&self) {
        let now = clock::now_secs();
        let mut fired: Vec<(TcpConn, Rc<dyn Fn(&TcpConn)>)> = Vec::new();
        {
            let mut idle = self.inner.idle.borrow_mut();
            for (threshold, list) in idle.iter_mut() {
                loop {
                    let expired = match list.front() {
                        Some(node) => node.last_active + threshold <= now,
                        None => false,
                    };
                    if !expired {
                        break;
                    }
                    let mut node = list.pop_front().expect("front just observed");
                    node.last_active = now;
                    fired.push((node.conn.clone(), node.cb.clone()));
                    list.push_back(node);
                }
            }
        }
        for (conn, cb) in fired {
            cb(&conn);
        }
    }

    // ---- connection registry ----

    pub(crate) fn register_conn(&self, conn: &TcpConn) {
        self.inner.conns.borrow_mut().insert(conn.id(), conn.clone());
    }

    pub(crate) fn remove_conn(&self, id: u64) {
        self.inner.conns.borrow_mut().remove(&id);
    }

    pub(crate) fn conn_by_id(&self, id: u64) -> Option<TcpConn> {
        self.inner.conns.borrow().get(&id).cloned()
    }

    pub(crate) fn park_reconnect(&self, conn: &TcpConn) {
        self.inner
            .reconnects
            .borrow_mut()
            .insert(conn.id(), conn.clone());
    }

    pub(crate) fn unpark_reconnect(&self, id: u64) {
        self.inner.reconnects.borrow_mut().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    fn spin_until<F: Fn() -> bool>(loop_: &EventLoop, deadline: Duration, done: F) {
        let start = Instant::now();
        while !done() {
            assert!(start.elapsed() < deadline, "condition not reached in time");
            loop_.run_once(10);
        }
    }

    #[test]
    fn test_timer_order_ties_broken_by_insertion() {
        let loop_ = EventLoop::new().unwrap();
        let fired = Rc::new(RefCell::new(Vec::new()));
        for (delay, tag) in [(30u64, 'A'), (30, 'B'), (10, 'C')] {
            let fired = fired.clone();
            loop_.schedule_after(delay, move |_| fired.borrow_mut().push(tag));
        }
        spin_until(&loop_, Duration::from_secs(2), || fired.borrow().len() == 3);
        assert_eq!(*fired.borrow(), vec!['C', 'A', 'B']);
    }

    #[test]
    fn test_cancel_after_fire_reports_not_found() {
        let loop_ = EventLoop::new().unwrap();
        let fired = Rc::new(Cell::new(false));
        let id = {
            let fired = fired.clone();
            loop_.schedule_after(5, move |_| fired.set(true))
        };
        spin_until(&loop_, Duration::from_secs(2), || fired.get());
        assert!(!loop_.cancel(id));
    }

    #[test]
    fn test_cancel_pending_timer() {
        let loop_ = EventLoop::new().unwrap();
        let fired = Rc::new(Cell::new(false));
        let id = {
            let fired = fired.clone();
            loop_.schedule_after(20, move |_| fired.set(true))
        };
        assert!(loop_.cancel(id));
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(60) {
            loop_.run_once(10);
        }
        assert!(!fired.get());
    }

    #[test]
    fn test_repeating_timer_measures_from_target() {
        let loop_ = EventLoop::new().unwrap();
        let stamps: Rc<RefCell<Vec<u64>>> = Rc::new(RefCell::new(Vec::new()));
        let t0 = clock::now_ms();
        {
            let stamps = stamps.clone();
            loop_.schedule_every(50, 50, move |_| stamps.borrow_mut().push(clock::now_ms()));
        }
        spin_until(&loop_, Duration::from_secs(5), || stamps.borrow().len() >= 3);
        let stamps = stamps.borrow();
        for (i, stamp) in stamps.iter().enumerate().take(3) {
            let target = t0 + 50 * (i as u64 + 1);
            assert!(
                *stamp >= target && *stamp < target + 45,
                "fire {i} at {stamp} vs target {target}"
            );
        }
    }

    #[test]
    fn test_post_from_other_thread_runs_on_loop() {
        let loop_ = EventLoop::new().unwrap();
        let handle = loop_.handle();
        let (tx, rx) = mpsc::channel();
        let poster = thread::spawn(move || {
            assert!(handle.post(move |_| {
                tx.send(thread::current().id()).unwrap();
            }));
        });
        poster.join().unwrap();
        let ran_on = Rc::new(RefCell::new(None));
        spin_until(&loop_, Duration::from_secs(2), || {
            if let Ok(id) = rx.try_recv() {
                *ran_on.borrow_mut() = Some(id);
            }
            ran_on.borrow().is_some()
        });
        assert_eq!(ran_on.borrow().unwrap(), thread::current().id());
    }

    #[test]
    fn test_bounded_inbox_rejects_when_full() {
        let loop_ = EventLoop::from_seed(LoopSeed::new(1).unwrap());
        let handle = loop_.handle();
        assert!(handle.post(|_| {}));
        assert!(!handle.post(|_| {}));
        loop_.run_once(0);
        assert!(handle.post(|_| {}));
    }
}
