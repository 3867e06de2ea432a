//! Indexed Allocator
//!
//! A bounded, alloc-once arena handing out `u32` indices instead of
//! addresses. Slots are never freed individually; callers recycle them
//! through their own free lists. Pages are committed lazily on first touch:
//! two threads racing on the same page both build one, the CAS loser throws
//! its copy away.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crate::packed::CacheAligned;

/// Fixed-capacity arena of `MAX_TOTAL_ITEMS` slots split into pages of
/// `ITEMS_PER_PAGE`. Index 0 is reserved as null.
pub struct IndexedAllocator<T, const MAX_TOTAL_ITEMS: u32, const ITEMS_PER_PAGE: u32> {
    next_index: CacheAligned<AtomicU32>,
    pages: Box<[AtomicPtr<T>]>,
}

impl<T: Default, const MAX_TOTAL_ITEMS: u32, const ITEMS_PER_PAGE: u32>
    IndexedAllocator<T, MAX_TOTAL_ITEMS, ITEMS_PER_PAGE>
{
    const PAGE_COUNT: usize = MAX_TOTAL_ITEMS.div_ceil(ITEMS_PER_PAGE) as usize;

    pub fn new() -> Self {
        assert!(ITEMS_PER_PAGE > 0 && MAX_TOTAL_ITEMS > 1);
        let pages = (0..Self::PAGE_COUNT)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Self {
            // Slot 0 stays unused so that index 0 can mean "null".
            next_index: CacheAligned::new(AtomicU32::new(1)),
            pages,
        }
    }

    /// Reserve `count` contiguous slots and return the first index.
    ///
    /// # Panics
    /// When the arena is exhausted. There is no way back from that: indices
    /// are never returned to the arena itself.
    pub fn alloc(&self, count: u32) -> u32 {
        let first = self.next_index.fetch_add(count, Ordering::Relaxed);
        let end = first.checked_add(count);
        assert!(
            end.is_some_and(|end| end <= MAX_TOTAL_ITEMS),
            "consumed {MAX_TOTAL_ITEMS} lock free links; there are no more"
        );
        for index in first..first + count {
            self.commit_page(index);
        }
        first
    }

    /// Resolve an index. `0` resolves to `None`.
    #[inline]
    pub fn get(&self, index: u32) -> Option<&T> {
        if index == 0 {
            return None;
        }
        let (page, slot) = Self::split(index);
        assert!(
            index < self.next_index.load(Ordering::Relaxed) && index < MAX_TOTAL_ITEMS,
            "index {index} was never allocated"
        );
        let base = self.pages[page].load(Ordering::Acquire);
        assert!(!base.is_null(), "page {page} for index {index} is not committed");
        // SAFETY: the page holds ITEMS_PER_PAGE initialized slots and is only
        // released when the allocator itself is dropped.
        Some(unsafe { &*base.add(slot) })
    }

    /// Number of indices handed out so far, including the reserved null slot.
    pub fn allocated(&self) -> u32 {
        self.next_index.load(Ordering::Relaxed).min(MAX_TOTAL_ITEMS)
    }

    pub const fn capacity(&self) -> u32 {
        MAX_TOTAL_ITEMS
    }

    #[inline]
    fn split(index: u32) -> (usize, usize) {
        ((index / ITEMS_PER_PAGE) as usize, (index % ITEMS_PER_PAGE) as usize)
    }

    fn commit_page(&self, index: u32) {
        let (page, _) = Self::split(index);
        if !self.pages[page].load(Ordering::Acquire).is_null() {
            return;
        }

        let fresh: Box<[T]> = (0..ITEMS_PER_PAGE).map(|_| T::default()).collect();
        let fresh = Box::into_raw(fresh) as *mut T;
        match self.pages[page].compare_exchange(
            ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => tracing::debug!(page, items = ITEMS_PER_PAGE, "committed arena page"),
            Err(winner) => {
                debug_assert!(!winner.is_null() && winner != fresh);
                // SAFETY: `fresh` came from Box::into_raw above and was never published.
                unsafe { drop(Self::page_box(fresh)) };
            }
        }
    }

    /// # Safety
    /// `base` must come from a boxed slice of exactly `ITEMS_PER_PAGE` items.
    unsafe fn page_box(base: *mut T) -> Box<[T]> {
        unsafe {
            Box::from_raw(ptr::slice_from_raw_parts_mut(
                base,
                ITEMS_PER_PAGE as usize,
            ))
        }
    }
}

impl<T: Default, const MAX_TOTAL_ITEMS: u32, const ITEMS_PER_PAGE: u32> Default
    for IndexedAllocator<T, MAX_TOTAL_ITEMS, ITEMS_PER_PAGE>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const MAX_TOTAL_ITEMS: u32, const ITEMS_PER_PAGE: u32> Drop
    for IndexedAllocator<T, MAX_TOTAL_ITEMS, ITEMS_PER_PAGE>
{
    fn drop(&mut self) {
        for page in self.pages.iter() {
            let base = page.load(Ordering::Acquire);
            if !base.is_null() {
                // SAFETY: every committed page was built as a boxed slice of
                // ITEMS_PER_PAGE items and we have exclusive access here.
                unsafe {
                    drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                        base,
                        ITEMS_PER_PAGE as usize,
                    )))
                };
            }
        }
    }
}

// SAFETY: slots are handed out as shared references only; T itself must be
// shareable for that to be sound.
unsafe impl<T: Send + Sync, const M: u32, const P: u32> Send for IndexedAllocator<T, M, P> {}
unsafe impl<T: Send + Sync, const M: u32, const P: u32> Sync for IndexedAllocator<T, M, P> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    type SmallArena = IndexedAllocator<AtomicUsize, 1024, 16>;

    #[test]
    fn test_index_zero_is_null() {
        let arena = SmallArena::new();
        assert!(arena.get(0).is_none());
        assert_eq!(arena.alloc(1), 1);
    }

    #[test]
    fn test_contiguous_ranges() {
        let arena = SmallArena::new();
        let first = arena.alloc(40);
        let second = arena.alloc(3);

        assert_eq!(first, 1);
        assert_eq!(second, 41);
        for index in first..second + 3 {
            arena.get(index).unwrap().store(index as usize, Ordering::Relaxed);
        }
        assert_eq!(arena.get(17).unwrap().load(Ordering::Relaxed), 17);
        assert_eq!(arena.allocated(), 44);
    }

    #[test]
    #[should_panic(expected = "there are no more")]
    fn test_exhaustion_is_fatal() {
        let arena = IndexedAllocator::<AtomicUsize, 8, 4>::new();
        arena.alloc(7);
        arena.alloc(1);
    }

    #[test]
    #[should_panic(expected = "never allocated")]
    fn test_unallocated_index_is_fatal() {
        let arena = SmallArena::new();
        arena.alloc(2);
        arena.get(5);
    }

    #[test]
    fn test_concurrent_page_commit() {
        let arena = Arc::new(IndexedAllocator::<AtomicUsize, 65_536, 64>::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let arena = Arc::clone(&arena);
            handles.push(thread::spawn(move || {
                (0..200).map(|_| arena.alloc(3)).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for first in handle.join().unwrap() {
                for index in first..first + 3 {
                    assert!(seen.insert(index));
                    let slot = arena.get(index).unwrap();
                    assert_eq!(slot.fetch_add(1, Ordering::Relaxed), 0);
                }
            }
        }
        assert_eq!(seen.len(), 8 * 200 * 3);
    }
}
