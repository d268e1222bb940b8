//! Bounded blocking task queue and worker pool.
//!
//! The queue is the only lock-protected structure in the core: one mutex and
//! one condition variable per queue instance, guarding the pending-items
//! list. Everything else relies on single-writer-thread confinement.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Thread-safe FIFO of deferred work items. A capacity of 0 means unbounded.
pub struct TaskQueue<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
    capacity: usize,
}

impl<T> TaskQueue<T> {
    pub fn new(capacity: usize) -> TaskQueue<T> {
        TaskQueue {
            state: Mutex::new(State {
                items: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue an item. Returns false when the queue is at capacity or has
    /// been shut down; the caller decides whether to retry or drop.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.state.lock().expect("task queue mutex poisoned");
        if state.closed || (self.capacity > 0 && state.items.len() >= self.capacity) {
            return false;
        }
        state.items.push_back(item);
        self.ready.notify_one();
        true
    }

    /// Block until an item is available, the queue shuts down, or the timeout
    /// elapses. Items still queued at shutdown continue to drain.
    pub fn pop_wait(&self, timeout: Option<Duration>) -> Option<T> {
        let mut state = self.state.lock().expect("task queue mutex poisoned");
        match timeout {
            None => {
                while state.items.is_empty() && !state.closed {
                    state = self
                        .ready
                        .wait(state)
                        .expect("task queue mutex poisoned");
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while state.items.is_empty() && !state.closed {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let (guard, _) = self
                        .ready
                        .wait_timeout(state, deadline - now)
                        .expect("task queue mutex poisoned");
                    state = guard;
                }
            }
        }
        state.items.pop_front()
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        self.state
            .lock()
            .expect("task queue mutex poisoned")
            .items
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("task queue mutex poisoned")
            .items
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Permanently wake all waiters. Further pushes fail.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().expect("task queue mutex poisoned");
        state.closed = true;
        self.ready.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.state
            .lock()
            .expect("task queue mutex poisoned")
            .closed
    }
}

/// A unit of deferred work for the pool.
pub type Job = Box<dyn FnOnce() + Send>;

/// Fixed pool of worker threads draining a shared [`TaskQueue`].
pub struct WorkerPool {
    tasks: Arc<TaskQueue<Job>>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(threads: usize, capacity: usize) -> WorkerPool {
        let tasks = Arc::new(TaskQueue::<Job>::new(capacity));
        let handles = (0..threads)
            .map(|i| {
                let queue = tasks.clone();
                thread::Builder::new()
                    .name(format!("kiln-worker-{i}"))
                    .spawn(move || {
                        while let Some(job) = queue.pop_wait(None) {
                            job();
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();
        WorkerPool {
            tasks,
            threads: handles,
        }
    }

    /// Queue a job. Returns false if the queue is full or shut down.
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.tasks.push(Box::new(job))
    }

    pub fn queued(&self) -> usize {
        self.tasks.len()
    }

    pub fn shutdown(&self) {
        self.tasks.shutdown();
    }

    /// Wait for all workers to drain and exit. Call after [`shutdown`].
    ///
    /// [`shutdown`]: WorkerPool::shutdown
    pub fn join(self) {
        for t in self.threads {
            t.join().expect("worker thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_bounded_push_fails_at_capacity() {
        let queue = TaskQueue::new(2);
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert!(!queue.push(3));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_pop_wait_times_out() {
        let queue: TaskQueue<u32> = TaskQueue::new(0);
        let start = Instant::now();
        assert_eq!(queue.pop_wait(Some(Duration::from_millis(30))), None);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_shutdown_wakes_and_drains() {
        let queue = Arc::new(TaskQueue::new(0));
        queue.push(7u32);
        queue.shutdown();
        assert!(!queue.push(8));
        // queued items drain even after shutdown
        assert_eq!(queue.pop_wait(None), Some(7));
        assert_eq!(queue.pop_wait(None), None);
    }

    #[test]
    fn test_shutdown_wakes_blocked_waiter() {
        let queue: Arc<TaskQueue<u32>> = Arc::new(TaskQueue::new(0));
        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop_wait(None))
        };
        thread::sleep(Duration::from_millis(20));
        queue.shutdown();
        assert_eq!(waiter.join().unwrap(), None);
    }

    #[test]
    fn test_worker_pool_runs_jobs() {
        static RAN: AtomicUsize = AtomicUsize::new(0);
        let pool = WorkerPool::new(2, 0);
        for _ in 0..10 {
            assert!(pool.spawn(|| {
                RAN.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.shutdown();
        pool.join();
        assert_eq!(RAN.load(Ordering::SeqCst), 10);
    }
}
