//! Stalling Priority Queue
//!
//! One FIFO per priority plus a master word shaped like a tagged pointer. The
//! master word's index bits are not an index: they are a bitmask of workers
//! that found every queue empty and went to sleep. A producer that sees a set
//! bit clears exactly one and tells its caller whom to wake.
//!
//! Both sides do a read-modify-write on the master word, and every push
//! advances its counter even when nobody is stalled. A consumer that scanned
//! the queues, saw nothing, and then lost the race to a producer therefore
//! fails its stall CAS and rescans instead of sleeping on a non-empty queue.

use crate::fifo::LockFreeFifo;
use crate::packed::CacheAligned;
use crate::tagged::{AtomicTaggedPointer, INDEX_BITS, TaggedPointer};

/// Workers that can stall on one queue: the width of the mask.
pub const MAX_STALLING_WORKERS: u32 = INDEX_BITS;

pub struct StallingQueue<T, const PRIORITIES: usize> {
    master_state: CacheAligned<AtomicTaggedPointer>,
    priority_queues: [LockFreeFifo<T>; PRIORITIES],
}

impl<T: Send, const PRIORITIES: usize> StallingQueue<T, PRIORITIES> {
    pub fn new() -> Self {
        assert!(PRIORITIES > 0, "a stalling queue needs at least one priority");
        Self {
            master_state: CacheAligned::new(AtomicTaggedPointer::new(TaggedPointer::NULL)),
            priority_queues: std::array::from_fn(|_| LockFreeFifo::new()),
        }
    }

    /// Enqueue `item` and, if any worker is stalled, unstall one of them.
    ///
    /// Returns the worker the caller must wake, or `None` when nobody was
    /// stalled (the mask is left as it was).
    pub fn push(&self, item: T, priority: usize) -> Option<u32> {
        assert!(priority < PRIORITIES, "priority {priority} out of range 0..{PRIORITIES}");
        self.priority_queues[priority].push(item);

        loop {
            let local_master = self.master_state.load();
            let stalled = local_master.ptr();
            let mut new_master = TaggedPointer::NULL;
            new_master.advance_counter_and_state(local_master, 1);

            if stalled == 0 {
                if self.master_state.compare_and_swap(local_master, new_master) {
                    return None;
                }
            } else {
                let worker = stalled.trailing_zeros();
                new_master.set_ptr(stalled & !(1 << worker));
                if self.master_state.compare_and_swap(local_master, new_master) {
                    return Some(worker);
                }
            }
        }
    }

    /// Take the highest-priority item (priority 0 first).
    ///
    /// With `allow_stall`, an empty scan registers `my_id` as stalled before
    /// returning `None`; the caller is expected to sleep until woken.
    pub fn pop(&self, my_id: u32, allow_stall: bool) -> Option<T> {
        assert!(
            my_id < MAX_STALLING_WORKERS,
            "worker id {my_id} does not fit the stall mask"
        );
        let my_bit = 1u32 << my_id;

        loop {
            let local_master = self.master_state.load();
            debug_assert!(
                local_master.ptr() & my_bit == 0,
                "worker {my_id} popped while marked stalled"
            );

            for queue in &self.priority_queues {
                if let Some(item) = queue.pop() {
                    return Some(item);
                }
            }
            if !allow_stall {
                return None;
            }

            let mut new_master = TaggedPointer::NULL;
            new_master.advance_counter_and_state(local_master, 1);
            new_master.set_ptr(local_master.ptr() | my_bit);
            if self.master_state.compare_and_swap(local_master, new_master) {
                return None;
            }
        }
    }

    /// Take the highest-priority item without a worker id; never stalls and
    /// leaves the mask alone. Meant for draining at shutdown.
    pub fn steal(&self) -> Option<T> {
        self.priority_queues.iter().find_map(LockFreeFifo::pop)
    }

    /// Bitmask of currently stalled workers.
    pub fn stalled_mask(&self) -> u32 {
        self.master_state.load().ptr()
    }

    /// Snapshot check across all priorities.
    pub fn is_empty(&self) -> bool {
        self.priority_queues.iter().all(LockFreeFifo::is_empty)
    }
}

impl<T: Send, const PRIORITIES: usize> Default for StallingQueue<T, PRIORITIES> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    #[test]
    fn test_push_without_stalled_worker_leaves_mask() {
        let queue = StallingQueue::<u32, 2>::new();
        assert_eq!(queue.push(1, 0), None);
        assert_eq!(queue.stalled_mask(), 0);
        assert_eq!(queue.pop(0, true), Some(1));
    }

    #[test]
    fn test_push_wakes_the_stalled_worker() {
        let queue = StallingQueue::<u32, 2>::new();
        assert_eq!(queue.pop(5, true), None);
        assert_eq!(queue.stalled_mask(), 1 << 5);

        assert_eq!(queue.push(7, 1), Some(5));
        assert_eq!(queue.stalled_mask(), 0);
        assert_eq!(queue.pop(5, true), Some(7));
    }

    #[test]
    fn test_one_wake_per_push() {
        let queue = StallingQueue::<u32, 1>::new();
        assert_eq!(queue.pop(1, true), None);
        assert_eq!(queue.pop(3, true), None);
        assert_eq!(queue.stalled_mask(), 0b1010);

        assert_eq!(queue.push(10, 0), Some(1));
        assert_eq!(queue.stalled_mask(), 0b1000);
        assert_eq!(queue.push(11, 0), Some(3));
        assert_eq!(queue.push(12, 0), None);
        assert_eq!(queue.stalled_mask(), 0);
    }

    #[test]
    fn test_pop_without_stall_does_not_register() {
        let queue = StallingQueue::<u32, 1>::new();
        assert_eq!(queue.pop(2, false), None);
        assert_eq!(queue.stalled_mask(), 0);
    }

    #[test]
    fn test_steal_ignores_the_mask() {
        let queue = StallingQueue::<u32, 2>::new();
        assert_eq!(queue.pop(4, true), None);
        queue.priority_queues[1].push(9);

        assert_eq!(queue.steal(), Some(9));
        assert_eq!(queue.steal(), None);
        assert_eq!(queue.stalled_mask(), 1 << 4);
    }

    #[test]
    fn test_priorities_drain_in_order() {
        let queue = StallingQueue::<&str, 3>::new();
        queue.push("low", 2);
        queue.push("mid", 1);
        queue.push("high", 0);
        queue.push("high2", 0);

        let drained: Vec<_> = std::iter::from_fn(|| queue.pop(0, false)).collect();
        assert_eq!(drained, ["high", "high2", "mid", "low"]);
        assert!(queue.is_empty());
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_bad_priority_is_fatal() {
        let queue = StallingQueue::<u32, 2>::new();
        queue.push(0, 2);
    }

    #[test]
    fn test_no_item_left_behind_under_contention() {
        // Consumers spin instead of sleeping; a returned wake clears their
        // flag. Every item pushed must be popped.
        const CONSUMERS: u32 = 4;
        const ITEMS: u32 = 20_000;

        let queue = Arc::new(StallingQueue::<u32, 2>::new());
        let popped = Arc::new(AtomicU32::new(0));
        let stalled_flags: Arc<Vec<AtomicU32>> =
            Arc::new((0..CONSUMERS).map(|_| AtomicU32::new(0)).collect());

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|id| {
                let queue = Arc::clone(&queue);
                let popped = Arc::clone(&popped);
                let stalled_flags = Arc::clone(&stalled_flags);
                thread::spawn(move || {
                    while popped.load(Ordering::Acquire) < ITEMS {
                        if stalled_flags[id as usize].load(Ordering::Acquire) != 0 {
                            std::hint::spin_loop();
                            continue;
                        }
                        // Raised before the stall bit can be, so a wake never
                        // arrives ahead of it.
                        stalled_flags[id as usize].store(1, Ordering::Release);
                        if queue.pop(id, true).is_some() {
                            stalled_flags[id as usize].store(0, Ordering::Release);
                            popped.fetch_add(1, Ordering::AcqRel);
                        }
                    }
                })
            })
            .collect();

        for i in 0..ITEMS {
            if let Some(worker) = queue.push(i, (i % 2) as usize) {
                assert!(worker < CONSUMERS);
                stalled_flags[worker as usize].store(0, Ordering::Release);
            }
        }
        // A worker can only stay parked once its scan saw every item taken,
        // so the remaining consumers drain the rest on their own.
        for consumer in consumers {
            consumer.join().unwrap();
        }
        assert!(queue.is_empty());
    }
}
