//! Strand Lock-Free Core
//!
//! The containers the Strand scheduler queues its work on.
//!
//! # Layout
//! - `tagged`: 64-bit `(index, counter)` words every structure CASes on
//! - `indexed`: bounded arena handing out `u32` indices, pages committed lazily
//! - `link`: the process-wide link arena with a per-thread bundle cache
//! - `lifo` / `fifo`: Treiber stack and Michael-Scott queue over links
//! - `stalling`: per-priority FIFOs plus a bitmask of sleeping consumers
//!
//! # Example
//! ```rust
//! use strand_lockfree::{LockFreeFifo, StallingQueue};
//!
//! let queue = LockFreeFifo::new();
//! queue.push("physics");
//! queue.push("cull");
//! assert_eq!(queue.pop(), Some("physics"));
//!
//! let stalling = StallingQueue::<u32, 2>::new();
//! assert_eq!(stalling.pop(3, true), None); // worker 3 goes to sleep
//! assert_eq!(stalling.push(42, 1), Some(3)); // ...and is the one to wake
//! ```

pub mod fifo;
pub mod indexed;
pub mod lifo;
pub mod link;
pub mod packed;
pub mod stalling;
pub mod tagged;

pub use fifo::LockFreeFifo;
pub use indexed::IndexedAllocator;
pub use lifo::{LifoRoot, LockFreeLifo};
pub use link::{LinkIndex, LinkNode, NUM_PER_BUNDLE, alloc_link, free_link, link};
pub use packed::{CACHE_LINE_SIZE, CacheAligned};
pub use stalling::{MAX_STALLING_WORKERS, StallingQueue};
pub use tagged::{AtomicTaggedPointer, MAX_NODES, TaggedPointer};
