//! Tagged Pointer
//!
//! A single 64-bit word packing an arena index (low 26 bits) with a
//! counter/state field (high 38 bits). Every lock-free structure in this crate
//! CASes the whole word, so a slot that was popped, recycled and pushed back
//! with the same index still compares unequal to a stale snapshot: the
//! counter moved on.
//!
//! The index is *not* an address. It has to be resolved through the arena
//! ([`crate::link::link`]); `0` is the null index.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Number of bits reserved for the arena index.
pub const INDEX_BITS: u32 = 26;

/// Maximum number of addressable nodes (2^26).
pub const MAX_NODES: u32 = 1 << INDEX_BITS;

/// Number of bits left for the counter/state field.
pub const COUNTER_BITS: u32 = 64 - INDEX_BITS;

const INDEX_MASK: u64 = (MAX_NODES as u64) - 1;
const COUNTER_MASK: u64 = (1u64 << COUNTER_BITS) - 1;

const _: () = assert!(MAX_NODES.is_power_of_two());

/// Packed `(index, counter_and_state)` value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct TaggedPointer(u64);

impl TaggedPointer {
    /// Null index with a zero counter.
    pub const NULL: Self = Self(0);

    /// Pack an index and a counter/state value.
    #[inline]
    pub fn new(index: u32, counter_and_state: u64) -> Self {
        let mut tagged = Self::NULL;
        tagged.set_all_field(index, counter_and_state);
        tagged
    }

    /// Reinterpret a raw word.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw 64-bit word.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn set_all_field(&mut self, index: u32, counter_and_state: u64) {
        debug_assert!(
            index < MAX_NODES && counter_and_state <= COUNTER_MASK,
            "tagged pointer field out of range: index {index}, counter {counter_and_state}"
        );
        self.0 = u64::from(index) | (counter_and_state << INDEX_BITS);
    }

    /// Arena index stored in the low bits.
    #[inline]
    pub const fn ptr(self) -> u32 {
        (self.0 & INDEX_MASK) as u32
    }

    #[inline]
    pub fn set_ptr(&mut self, index: u32) {
        self.set_all_field(index, self.counter_and_state());
    }

    /// Counter and state stored in the high bits.
    #[inline]
    pub const fn counter_and_state(self) -> u64 {
        self.0 >> INDEX_BITS
    }

    #[inline]
    pub fn set_counter_and_state(&mut self, counter_and_state: u64) {
        self.set_all_field(self.ptr(), counter_and_state);
    }

    /// `true` when the index is 0, whatever the counter says.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.ptr() == 0
    }

    /// Set this pointer's counter to `from`'s counter plus `aba_inc`.
    ///
    /// `aba_inc` must be a power of two; the bits below it are free for
    /// [`state`](Self::state). When the counter wraps the calling thread
    /// sleeps briefly, which pushes any reader still holding a snapshot from
    /// the previous lap out of its CAS window.
    #[inline]
    pub fn advance_counter_and_state(&mut self, from: TaggedPointer, aba_inc: u64) {
        debug_assert!(aba_inc.is_power_of_two());
        let previous = from.counter_and_state();
        let next = previous.wrapping_add(aba_inc) & COUNTER_MASK;
        self.set_counter_and_state(next);
        if next < previous {
            tracing::warn!(previous, next, "tagged pointer counter wrapped");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// State bits living below the ABA stride.
    #[inline]
    pub fn state(self, aba_inc: u64) -> u64 {
        debug_assert!(aba_inc.is_power_of_two());
        self.counter_and_state() & (aba_inc - 1)
    }

    #[inline]
    pub fn set_state(&mut self, aba_inc: u64, value: u64) {
        debug_assert!(aba_inc.is_power_of_two() && value < aba_inc);
        self.set_counter_and_state((self.counter_and_state() & !(aba_inc - 1)) | value);
    }
}

impl fmt::Debug for TaggedPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaggedPointer")
            .field("ptr", &self.ptr())
            .field("counter_and_state", &self.counter_and_state())
            .finish()
    }
}

/// Atomic cell holding a [`TaggedPointer`].
#[derive(Default)]
#[repr(transparent)]
pub struct AtomicTaggedPointer(AtomicU64);

impl AtomicTaggedPointer {
    pub const fn new(value: TaggedPointer) -> Self {
        Self(AtomicU64::new(value.0))
    }

    /// Atomically read the whole word.
    #[inline]
    pub fn load(&self) -> TaggedPointer {
        TaggedPointer(self.0.load(Ordering::Acquire))
    }

    /// Plain store; only valid while no other thread can race on this word.
    #[inline]
    pub fn store(&self, value: TaggedPointer) {
        self.0.store(value.0, Ordering::Release);
    }

    /// Swap in `exchange` if the word still equals `comparand`.
    #[inline]
    pub fn compare_and_swap(&self, comparand: TaggedPointer, exchange: TaggedPointer) -> bool {
        self.0
            .compare_exchange(comparand.0, exchange.0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl fmt::Debug for AtomicTaggedPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load().fmt(f)
    }
}
