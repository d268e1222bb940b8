//! A fixed pool of event loops, one per worker thread.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crate::event_loop::{EventLoop, LoopHandle, LoopSeed};

/// Round-robin assignment over a group's loop handles. Cloneable and
/// shareable across threads; an allocator over a single loop always yields
/// that loop.
#[derive(Clone)]
pub struct LoopAllocator {
    loops: Arc<Vec<LoopHandle>>,
    next: Arc<AtomicUsize>,
}

impl LoopAllocator {
    pub(crate) fn new(loops: Vec<LoopHandle>) -> LoopAllocator {
        assert!(!loops.is_empty(), "allocator needs at least one loop");
        LoopAllocator {
            loops: Arc::new(loops),
            next: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The next loop in rotation.
    pub fn allocate(&self) -> LoopHandle {
        let c = self.next.fetch_add(1, Ordering::Relaxed);
        self.loops[c % self.loops.len()].clone()
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&LoopHandle> {
        self.loops.get(index)
    }
}

/// A fixed set of event loops run one per OS thread, so accept handling and
/// connection I/O can spread across cores. Loop state is assembled on each
/// worker thread from a pre-created seed.
pub struct LoopGroup {
    seeds: Vec<LoopSeed>,
    handles: Vec<LoopHandle>,
}

impl LoopGroup {
    /// Create `loops` seeds with unbounded task inboxes.
    pub fn new(loops: usize) -> std::io::Result<LoopGroup> {
        LoopGroup::with_task_capacity(loops, 0)
    }

    /// Create `loops` seeds whose cross-thread inboxes hold at most
    /// `task_capacity` tasks (0 means unbounded).
    pub fn with_task_capacity(loops: usize, task_capacity: usize) -> std::io::Result<LoopGroup> {
        assert!(loops >= 1, "a loop group needs at least one loop");
        let seeds = (0..loops)
            .map(|_| LoopSeed::new(task_capacity))
            .collect::<std::io::Result<Vec<_>>>()?;
        let handles = seeds.iter().map(|s| s.handle()).collect();
        Ok(LoopGroup { seeds, handles })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn handles(&self) -> &[LoopHandle] {
        &self.handles
    }

    pub fn allocator(&self) -> LoopAllocator {
        LoopAllocator::new(self.handles.clone())
    }

    /// Signal every loop in the group to stop.
    pub fn exit_all(&self) {
        for h in &self.handles {
            h.exit();
        }
    }

    /// Run the group: worker threads for all loops but the last, the last
    /// loop on the calling thread, then join the workers.
    pub fn run(self) {
        let mut seeds = self.seeds;
        let last = seeds.pop().expect("group has at least one loop");
        let joins: Vec<_> = seeds
            .into_iter()
            .enumerate()
            .map(|(i, seed)| {
                thread::Builder::new()
                    .name(format!("kiln-loop-{i}"))
                    .spawn(move || {
                        EventLoop::from_seed(seed).run();
                    })
                    .expect("failed to spawn loop thread")
            })
            .collect();
        EventLoop::from_seed(last).run();
        for j in joins {
            j.join().expect("loop thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_allocation() {
        let group = LoopGroup::new(3).unwrap();
        let alloc = group.allocator();
        let a = alloc.allocate().id();
        let b = alloc.allocate().id();
        let c = alloc.allocate().id();
        let d = alloc.allocate().id();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
        assert_eq!(a, d);
        group.exit_all();
        group.run();
    }

    #[test]
    fn test_exit_before_run_returns() {
        let group = LoopGroup::new(2).unwrap();
        group.exit_all();
        // all loops observe the exit flag immediately
        group.run();
    }
}
