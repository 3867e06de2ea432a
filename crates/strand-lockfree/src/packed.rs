//! Cache Alignment Utilities
//!
//! Hot atomics shared between threads (list heads, tails, the arena cursor,
//! the stalling mask) each get their own cache line so that a CAS storm on one
//! of them does not invalidate its neighbours.

use std::ops::{Deref, DerefMut};

/// Cache line size (64 bytes on most modern CPUs)
pub const CACHE_LINE_SIZE: usize = 64;

/// Cache-aligned wrapper for types.
///
/// # Example
/// ```rust
/// use std::sync::atomic::{AtomicU64, Ordering};
/// use strand_lockfree::CacheAligned;
///
/// let counter = CacheAligned::new(AtomicU64::new(7));
/// assert_eq!(counter.load(Ordering::Relaxed), 7);
/// assert_eq!(std::mem::align_of_val(&counter), 64);
/// ```
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct CacheAligned<T> {
    value: T,
}

impl<T> CacheAligned<T> {
    /// Create a new cache-aligned value.
    #[inline]
    pub const fn new(value: T) -> Self {
        Self { value }
    }

    /// Get the inner value.
    #[inline]
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Deref for CacheAligned<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<T> DerefMut for CacheAligned<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_aligned_layout() {
        let pair = [CacheAligned::new(1u8), CacheAligned::new(2u8)];

        assert_eq!(std::mem::size_of::<CacheAligned<u8>>(), CACHE_LINE_SIZE);
        let first = &pair[0] as *const _ as usize;
        let second = &pair[1] as *const _ as usize;
        assert_eq!(second - first, CACHE_LINE_SIZE);
        assert_eq!(*pair[1], 2);
    }
}
