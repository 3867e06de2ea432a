//! Lock-Free FIFO
//!
//! Michael-Scott queue over arena links. The queue always holds one sentinel
//! link: `head` points at it and the first real value lives in the
//! sentinel's successor. Popping promotes that successor to be the new
//! sentinel and recycles the old one.
//!
//! Pushes from racing producers all land, but their relative order is
//! whatever order their CASes won in.

use std::marker::PhantomData;
use std::sync::atomic::Ordering;

use crate::link::{LinkIndex, alloc_link, free_link, link};
use crate::packed::CacheAligned;
use crate::tagged::{AtomicTaggedPointer, TaggedPointer};

/// Multi-producer, multi-consumer queue of owned values.
pub struct LockFreeFifo<T> {
    head: CacheAligned<AtomicTaggedPointer>,
    tail: CacheAligned<AtomicTaggedPointer>,
    aba_inc: u64,
    _marker: PhantomData<Box<T>>,
}

impl<T: Send> LockFreeFifo<T> {
    /// Empty queue with an ABA stride of 1.
    pub fn new() -> Self {
        Self::with_aba_stride(1)
    }

    /// Empty queue whose tagged words advance by `aba_inc` per change.
    pub fn with_aba_stride(aba_inc: u64) -> Self {
        assert!(aba_inc.is_power_of_two(), "ABA stride {aba_inc} is not a power of two");
        let sentinel = alloc_link();
        let root = TaggedPointer::new(sentinel, 0);
        Self {
            head: CacheAligned::new(AtomicTaggedPointer::new(root)),
            tail: CacheAligned::new(AtomicTaggedPointer::new(root)),
            aba_inc,
            _marker: PhantomData,
        }
    }

    pub fn push(&self, item: T) {
        let new_index = alloc_link();
        let payload = Box::into_raw(Box::new(item));
        link(new_index).payload.store(payload.cast(), Ordering::Release);
        self.push_link(new_index);
    }

    fn push_link(&self, new_index: LinkIndex) {
        loop {
            let local_tail = self.tail.load();
            let tail_node = link(local_tail.ptr());
            let local_next = tail_node.next.load();
            if local_tail != self.tail.load() {
                continue;
            }

            if local_next.is_null() {
                let mut new_next = TaggedPointer::new(new_index, 0);
                new_next.advance_counter_and_state(local_next, self.aba_inc);
                if tail_node.next.compare_and_swap(local_next, new_next) {
                    self.swing_tail(local_tail, new_index);
                    return;
                }
            } else {
                // Tail is lagging behind a completed link; help it along.
                self.swing_tail(local_tail, local_next.ptr());
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        loop {
            let local_head = self.head.load();
            let local_tail = self.tail.load();
            let local_next = link(local_head.ptr()).next.load();
            if local_head != self.head.load() {
                continue;
            }

            if local_head.ptr() == local_tail.ptr() {
                if local_next.is_null() {
                    return None;
                }
                self.swing_tail(local_tail, local_next.ptr());
                continue;
            }
            if local_next.is_null() {
                // Read through a sentinel that was recycled under us.
                continue;
            }

            // The payload has to be read before the CAS: once head moves, the
            // successor may be popped and recycled by someone else.
            let next_node = link(local_next.ptr());
            let payload = next_node.payload.load(Ordering::Acquire);
            let mut new_head = TaggedPointer::new(local_next.ptr(), 0);
            new_head.advance_counter_and_state(local_head, self.aba_inc);
            if self.head.compare_and_swap(local_head, new_head) {
                // The successor is now the sentinel; its stale payload is
                // never read again and is cleared when the link is recycled.
                free_link(local_head.ptr());
                debug_assert!(!payload.is_null(), "queued link {} has no payload", local_next.ptr());
                // SAFETY: the payload came from Box::into_raw in `push` and the
                // winning CAS hands ownership to exactly one popper.
                return Some(*unsafe { Box::from_raw(payload.cast::<T>()) });
            }
        }
    }

    /// Snapshot emptiness check; may be stale as soon as it returns.
    pub fn is_empty(&self) -> bool {
        loop {
            let local_head = self.head.load();
            let local_next = link(local_head.ptr()).next.load();
            if local_head == self.head.load() {
                return local_next.is_null();
            }
        }
    }

    /// Stride this queue's counters advance by.
    pub fn aba_stride(&self) -> u64 {
        self.aba_inc
    }

    fn swing_tail(&self, local_tail: TaggedPointer, to: LinkIndex) {
        let mut new_tail = TaggedPointer::new(to, 0);
        new_tail.advance_counter_and_state(local_tail, self.aba_inc);
        // Losing is fine: somebody else already moved it.
        self.tail.compare_and_swap(local_tail, new_tail);
    }
}

impl<T: Send> Default for LockFreeFifo<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LockFreeFifo<T> {
    fn drop(&mut self) {
        // Exclusive access: walk the chain directly.
        let sentinel = self.head.load().ptr();
        let mut current = link(sentinel).next.load().ptr();
        while current != 0 {
            let node = link(current);
            let next = node.next.load().ptr();
            let payload = node.payload.load(Ordering::Acquire);
            if !payload.is_null() {
                // SAFETY: still owned by the queue; nobody popped it.
                drop(unsafe { Box::from_raw(payload.cast::<T>()) });
            }
            free_link(current);
            current = next;
        }
        free_link(sentinel);
    }
}

// SAFETY: values move between threads by ownership only.
unsafe impl<T: Send> Send for LockFreeFifo<T> {}
unsafe impl<T: Send> Sync for LockFreeFifo<T> {}
