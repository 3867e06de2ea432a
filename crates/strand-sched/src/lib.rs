//! Strand Scheduler
//!
//! Task schedulers for a frame-pipelined engine: dedicated Game, Render and
//! RHI threads, sync/async worker pools, completion counters and reusable
//! task graphs.
//!
//! # Layout
//! - `task`: the [`Task`] unit of work and the [`Work`] trait
//! - `scheduler`: [`SingleScheduler`] (one bound thread) and
//!   [`PooledTaskScheduler`] (any thread of a pool)
//! - `thread`: [`ThreadProxy`], [`ThreadPoolBase`], [`StallingWorkerPool`]
//! - `completion`: [`CompletionCounter`] fan-in with its hooks
//! - `graph`: [`TaskGraphProxy`] dependency graphs replayed every frame
//! - `manager`: [`SchedulerContext`] and the process-wide [`TaskSchedulerManager`]
//!
//! # Example
//! ```rust
//! use std::sync::Arc;
//! use strand_sched::{
//!     CompletionCounter, PooledTaskScheduler, Scheduler, Task, ThreadPoolBase, TriggerEvent,
//! };
//!
//! let workers = Arc::new(PooledTaskScheduler::new("workers"));
//! let pool = ThreadPoolBase::new(2, 256 * 1024, "worker").unwrap();
//! pool.attach_to_scheduler(workers.clone());
//!
//! let counter = Arc::new(CompletionCounter::new(TriggerEvent::default()));
//! counter.promise(4);
//! for _ in 0..4 {
//!     let counter = Arc::clone(&counter);
//!     workers.push_task(Task::from_fn(move || counter.notify()));
//! }
//! counter.hook().wait();
//! pool.wait_for_completion();
//! ```

pub mod completion;
pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod manager;
pub mod scheduler;
pub mod task;
pub mod thread;

pub use completion::{CompletionCounter, OnCompleted, PushContinuation, TriggerEvent};
pub use config::{SchedulerConfig, WorkerCount, logical_cores};
pub use error::{Result, SchedError};
pub use event::Event;
pub use graph::{GraphTask, NodeId, NodeState, TaskGraphProxy};
pub use manager::{SchedulerContext, TaskSchedulerManager};
pub use scheduler::{PooledTaskScheduler, Scheduler, SchedulerId, SingleScheduler};
pub use task::{FnWork, Task, Work};
pub use thread::{StallingWorkerPool, ThreadPoolBase, ThreadProxy, ThreadRef};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
