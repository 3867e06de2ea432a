//! Lock-Free LIFO
//!
//! An intrusive Treiber stack over arena links. The head is a tagged pointer,
//! so every successful push or pop advances its counter and a popper holding
//! a stale head can never swing the stack onto a recycled node.

use std::marker::PhantomData;
use std::sync::atomic::Ordering;

use crate::link::{LinkArena, LinkIndex, alloc_link, allocator, free_link, link};
use crate::packed::CacheAligned;
use crate::tagged::{AtomicTaggedPointer, TaggedPointer};

// ============================================================================
// Intrusive root
// ============================================================================

/// Tagged head of an intrusive stack chained through `LinkNode::single_next`.
pub struct LifoRoot {
    head: CacheAligned<AtomicTaggedPointer>,
    aba_inc: u64,
}

impl LifoRoot {
    /// Root with an ABA stride of 1.
    pub const fn new() -> Self {
        Self::with_aba_stride(1)
    }

    /// Root whose counter advances by `aba_inc` (a power of two) per change.
    pub const fn with_aba_stride(aba_inc: u64) -> Self {
        assert!(aba_inc.is_power_of_two());
        Self {
            head: CacheAligned::new(AtomicTaggedPointer::new(TaggedPointer::NULL)),
            aba_inc,
        }
    }

    /// Current head snapshot.
    #[inline]
    pub fn head(&self) -> TaggedPointer {
        self.head.load()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head().is_null()
    }

    pub fn push_link(&self, arena: &LinkArena, item: LinkIndex) {
        let node = match arena.get(item) {
            Some(node) => node,
            None => panic!("pushed the null link"),
        };
        loop {
            let local_head = self.head.load();
            node.single_next.store(local_head.ptr(), Ordering::Relaxed);
            let mut new_head = TaggedPointer::new(item, 0);
            new_head.advance_counter_and_state(local_head, self.aba_inc);
            if self.head.compare_and_swap(local_head, new_head) {
                return;
            }
        }
    }

    /// Pop the top link, or `0` when empty.
    pub fn pop_link(&self, arena: &LinkArena) -> LinkIndex {
        loop {
            let local_head = self.head.load();
            if local_head.is_null() {
                return 0;
            }
            if let Ok(item) = self.try_pop_from(arena, local_head) {
                return item;
            }
        }
    }

    /// One pop attempt against a caller-held head snapshot.
    ///
    /// Fails, returning the current head, if anything touched the stack since
    /// `snapshot` was taken, even if the same index is back on top.
    pub fn try_pop_from(
        &self,
        arena: &LinkArena,
        snapshot: TaggedPointer,
    ) -> Result<LinkIndex, TaggedPointer> {
        let Some(node) = arena.get(snapshot.ptr()) else {
            return Err(self.head.load());
        };
        let mut new_head = TaggedPointer::new(node.single_next.load(Ordering::Relaxed), 0);
        new_head.advance_counter_and_state(snapshot, self.aba_inc);
        if self.head.compare_and_swap(snapshot, new_head) {
            node.single_next.store(0, Ordering::Relaxed);
            Ok(snapshot.ptr())
        } else {
            Err(self.head.load())
        }
    }
}

impl Default for LifoRoot {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Owning stack
// ============================================================================

/// Multi-producer, multi-consumer stack of owned values.
///
/// Each value is boxed and parked in a link's payload.
pub struct LockFreeLifo<T> {
    root: LifoRoot,
    _marker: PhantomData<Box<T>>,
}

impl<T: Send> LockFreeLifo<T> {
    pub const fn new() -> Self {
        Self {
            root: LifoRoot::new(),
            _marker: PhantomData,
        }
    }

    pub fn push(&self, item: T) {
        let index = alloc_link();
        let payload = Box::into_raw(Box::new(item));
        link(index).payload.store(payload.cast(), Ordering::Release);
        self.root.push_link(allocator().arena(), index);
    }

    pub fn pop(&self) -> Option<T> {
        let index = self.root.pop_link(allocator().arena());
        if index == 0 {
            return None;
        }
        let payload = link(index).payload.load(Ordering::Acquire);
        debug_assert!(!payload.is_null(), "popped link {index} has no payload");
        free_link(index);
        // SAFETY: the payload was produced by Box::into_raw in `push` and the
        // winning pop is its only owner.
        Some(*unsafe { Box::from_raw(payload.cast::<T>()) })
    }

    /// Drain every value currently on the stack, top first.
    pub fn pop_all(&self) -> Vec<T> {
        std::iter::from_fn(|| self.pop()).collect()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// The underlying root; exposes the tagged head for inspection.
    pub fn root(&self) -> &LifoRoot {
        &self.root
    }
}

impl<T: Send> Default for LockFreeLifo<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LockFreeLifo<T> {
    fn drop(&mut self) {
        let arena = allocator().arena();
        loop {
            let index = self.root.pop_link(arena);
            if index == 0 {
                break;
            }
            let payload = link(index).payload.load(Ordering::Acquire);
            free_link(index);
            if !payload.is_null() {
                // SAFETY: see `pop`.
                drop(unsafe { Box::from_raw(payload.cast::<T>()) });
            }
        }
    }
}

// SAFETY: values move between threads by ownership only.
unsafe impl<T: Send> Send for LockFreeLifo<T> {}
unsafe impl<T: Send> Sync for LockFreeLifo<T> {}
