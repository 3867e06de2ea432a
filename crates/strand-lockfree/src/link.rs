//! Link Nodes and the Link Allocator
//!
//! All lock-free lists share one process-wide arena of [`LinkNode`]s. Nodes
//! are never freed, only recycled. Recycling goes through a per-thread cache
//! of two bundles (one partial, one full, up to [`NUM_PER_BUNDLE`] nodes each)
//! so a thread only touches the shared free list about once every 64
//! alloc/free calls.
//!
//! The per-thread cache is deliberately never torn down: nodes parked in the
//! cache of an exiting thread stay parked until process exit. Draining them
//! from a thread-local destructor could race with lists still referencing
//! those indices.

use std::cell::Cell;
use std::ptr;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crate::indexed::IndexedAllocator;
use crate::lifo::LifoRoot;
use crate::packed::CACHE_LINE_SIZE;
use crate::tagged::{AtomicTaggedPointer, MAX_NODES, TaggedPointer};

/// Nodes exchanged between a thread cache and the global free list at once.
pub const NUM_PER_BUNDLE: u32 = 64;

/// Nodes per lazily committed arena page.
pub const LINKS_PER_PAGE: u32 = 16_384;

/// Arena index of a link; `0` is null.
pub type LinkIndex = u32;

/// The arena type holding every link.
pub type LinkArena = IndexedAllocator<LinkNode, MAX_NODES, LINKS_PER_PAGE>;

/// One list node.
///
/// * `next`: tagged successor, used by the FIFO (and, while the node is
///   free, to chain the nodes of a bundle; the counter half is preserved).
/// * `single_next`: plain successor, used by the LIFO.
/// * `payload`: the value carried; null whenever the node is free.
#[derive(Debug, Default)]
pub struct LinkNode {
    pub(crate) next: AtomicTaggedPointer,
    pub(crate) single_next: AtomicU32,
    pub(crate) payload: AtomicPtr<()>,
}

impl LinkNode {
    /// `true` while nothing is attached to this node.
    pub fn is_vacant(&self) -> bool {
        self.payload.load(Ordering::Acquire).is_null()
    }
}

#[derive(Clone, Copy)]
struct ThreadLocalCache {
    full_bundle: LinkIndex,
    partial_bundle: LinkIndex,
    num_partial: u32,
}

thread_local! {
    static CACHE: Cell<ThreadLocalCache> = const {
        Cell::new(ThreadLocalCache {
            full_bundle: 0,
            partial_bundle: 0,
            num_partial: 0,
        })
    };
}

/// Arena plus the global free list of bundles.
pub struct LinkAllocator {
    arena: LinkArena,
    global_free_bundles: LifoRoot,
}

static LINK_ALLOCATOR: LazyLock<LinkAllocator> = LazyLock::new(|| LinkAllocator {
    arena: LinkArena::new(),
    global_free_bundles: LifoRoot::with_aba_stride(CACHE_LINE_SIZE as u64),
});

/// The process-wide link allocator.
#[inline]
pub fn allocator() -> &'static LinkAllocator {
    &LINK_ALLOCATOR
}

/// Resolve a non-null link index.
#[inline]
pub fn link(index: LinkIndex) -> &'static LinkNode {
    allocator().node(index)
}

/// Take a vacant link from the calling thread's cache.
#[inline]
pub fn alloc_link() -> LinkIndex {
    allocator().pop()
}

/// Return a link to the calling thread's cache.
#[inline]
pub fn free_link(index: LinkIndex) {
    allocator().push(index)
}

impl LinkAllocator {
    #[inline]
    pub fn node(&self, index: LinkIndex) -> &LinkNode {
        match self.arena.get(index) {
            Some(node) => node,
            None => panic!("null link dereferenced"),
        }
    }

    pub fn arena(&self) -> &LinkArena {
        &self.arena
    }

    /// Pop a vacant node, refilling the thread cache when it runs dry.
    pub fn pop(&self) -> LinkIndex {
        CACHE.with(|cell| {
            let mut tls = cell.get();
            if tls.partial_bundle == 0 {
                if tls.full_bundle != 0 {
                    tls.partial_bundle = tls.full_bundle;
                    tls.full_bundle = 0;
                } else {
                    tls.partial_bundle = self.global_free_bundles.pop_link(&self.arena);
                    if tls.partial_bundle == 0 {
                        tls.partial_bundle = self.carve_bundle();
                    }
                }
                tls.num_partial = NUM_PER_BUNDLE;
            }

            let result = tls.partial_bundle;
            let node = self.node(result);
            let mut next = node.next.load();
            tls.partial_bundle = next.ptr();
            tls.num_partial -= 1;
            next.set_ptr(0);
            node.next.store(next);
            cell.set(tls);

            debug_assert!(
                node.is_vacant() && node.single_next.load(Ordering::Relaxed) == 0,
                "link {result} handed out while still in use"
            );
            result
        })
    }

    /// Push a node back. The node must not be reachable from any list.
    pub fn push(&self, index: LinkIndex) {
        CACHE.with(|cell| {
            let mut tls = cell.get();
            if tls.num_partial >= NUM_PER_BUNDLE {
                if tls.full_bundle != 0 {
                    self.global_free_bundles.push_link(&self.arena, tls.full_bundle);
                }
                tls.full_bundle = tls.partial_bundle;
                tls.partial_bundle = 0;
                tls.num_partial = 0;
            }

            let node = self.node(index);
            node.single_next.store(0, Ordering::Relaxed);
            node.payload.store(ptr::null_mut(), Ordering::Release);
            let mut next = node.next.load();
            next.set_ptr(tls.partial_bundle);
            node.next.store(next);
            tls.partial_bundle = index;
            tls.num_partial += 1;
            cell.set(tls);
        })
    }

    /// Reserve a fresh bundle from the arena and chain it through `next`.
    fn carve_bundle(&self) -> LinkIndex {
        let first = self.arena.alloc(NUM_PER_BUNDLE);
        let mut head = 0;
        for index in first..first + NUM_PER_BUNDLE {
            let node = self.node(index);
            node.next.store(TaggedPointer::new(head, 0));
            node.single_next.store(0, Ordering::Relaxed);
            node.payload.store(ptr::null_mut(), Ordering::Relaxed);
            head = index;
        }
        tracing::debug!(first, count = NUM_PER_BUNDLE, "carved link bundle");
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_alloc_hands_out_vacant_unique_links() {
        let links: Vec<_> = (0..3 * NUM_PER_BUNDLE).map(|_| alloc_link()).collect();
        let unique: HashSet<_> = links.iter().copied().collect();

        assert_eq!(unique.len(), links.len());
        for &index in &links {
            assert_ne!(index, 0);
            let node = link(index);
            assert!(node.is_vacant());
            assert_eq!(node.next.load().ptr(), 0);
        }
        for index in links {
            free_link(index);
        }
    }

    #[test]
    fn test_thread_cache_recycles_locally() {
        let first = alloc_link();
        free_link(first);
        assert_eq!(alloc_link(), first);
        free_link(first);
    }

    #[test]
    fn test_free_preserves_next_counter() {
        let index = alloc_link();
        let node = link(index);
        node.next.store(TaggedPointer::new(0, 77));
        free_link(index);

        // The node is parked on this thread's partial bundle.
        assert_eq!(node.next.load().counter_and_state(), 77);
        assert_eq!(alloc_link(), index);
        assert_eq!(node.next.load(), TaggedPointer::new(0, 77));
        free_link(index);
    }

    #[test]
    fn test_bundles_flow_between_threads() {
        // A producer frees more than two bundles' worth so that full bundles
        // spill onto the global list, where other threads can pick them up.
        let produced: Vec<_> = thread::spawn(|| {
            let links: Vec<_> = (0..4 * NUM_PER_BUNDLE).map(|_| alloc_link()).collect();
            for &index in &links {
                free_link(index);
            }
            links
        })
        .join()
        .unwrap();

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                thread::spawn(|| {
                    let links: Vec<_> = (0..NUM_PER_BUNDLE).map(|_| alloc_link()).collect();
                    for &index in &links {
                        assert!(link(index).is_vacant());
                    }
                    links
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for consumer in consumers {
            for index in consumer.join().unwrap() {
                assert!(seen.insert(index), "link {index} handed out twice");
            }
        }
        assert!(!produced.is_empty());
    }
}
