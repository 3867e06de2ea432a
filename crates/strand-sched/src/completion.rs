//! Completion Counter
//!
//! Fan-in without a graph: promise `n` notifications up front, have each of
//! the `n` fanned-out tasks call [`notify`](CompletionCounter::notify) when it
//! finishes, and the thread that brings the count to zero runs the hook once.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::event::Event;
use crate::scheduler::Scheduler;
use crate::task::Task;

/// Hook run by the last notifier.
pub trait OnCompleted: Send + Sync {
    fn on_completed(&self);
}

impl<F: Fn() + Send + Sync> OnCompleted for F {
    fn on_completed(&self) {
        self()
    }
}

/// Countdown that fires its hook when it reaches zero
pub struct CompletionCounter<H> {
    counter: AtomicI32,
    hook: H,
}

impl<H: OnCompleted> CompletionCounter<H> {
    pub fn new(hook: H) -> Self {
        Self {
            counter: AtomicI32::new(0),
            hook,
        }
    }

    /// Expect `count` notifications.
    ///
    /// A new promise must not overlap the previous one; debug builds assert
    /// that the counter was back at zero. Promising zero never fires the hook.
    pub fn promise(&self, count: i32) {
        assert!(count >= 0, "cannot promise {count} notifications");
        let previous = self.counter.swap(count, Ordering::AcqRel);
        debug_assert_eq!(
            previous, 0,
            "promised {count} while {previous} notifications were outstanding"
        );
    }

    /// Report one completion; the call that reaches zero runs the hook.
    pub fn notify(&self) {
        let previous = self.counter.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "notified more times than promised");
        if previous == 1 {
            self.hook.on_completed();
        }
    }

    /// Notifications still outstanding.
    pub fn outstanding(&self) -> i32 {
        self.counter.load(Ordering::Acquire)
    }

    pub fn hook(&self) -> &H {
        &self.hook
    }
}

impl<H> std::fmt::Debug for CompletionCounter<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionCounter")
            .field("outstanding", &self.counter.load(Ordering::Relaxed))
            .finish()
    }
}

// ============================================================================
// Hooks
// ============================================================================

/// Synchronous join: triggers an event an outside thread waits on.
#[derive(Debug, Clone, Default)]
pub struct TriggerEvent {
    event: Arc<Event>,
}

impl TriggerEvent {
    pub fn new(event: Arc<Event>) -> Self {
        Self { event }
    }

    pub fn event(&self) -> &Arc<Event> {
        &self.event
    }

    /// Block until the counter has fired.
    pub fn wait(&self) {
        self.event.wait();
    }
}

impl OnCompleted for TriggerEvent {
    fn on_completed(&self) {
        self.event.trigger();
    }
}

/// Asynchronous join: pushes a continuation task to a scheduler.
pub struct PushContinuation {
    scheduler: Arc<dyn Scheduler>,
    continuation: Mutex<Option<Task>>,
}

impl PushContinuation {
    pub fn new(scheduler: Arc<dyn Scheduler>, continuation: Task) -> Self {
        Self {
            scheduler,
            continuation: Mutex::new(Some(continuation)),
        }
    }

    /// Install the continuation for the next promise cycle.
    pub fn set_continuation(&self, continuation: Task) {
        let previous = self
            .continuation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(continuation);
        debug_assert!(previous.is_none(), "continuation replaced before it ran");
    }
}

impl OnCompleted for PushContinuation {
    fn on_completed(&self) {
        let continuation = self
            .continuation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match continuation {
            Some(task) => self.scheduler.push_task(task),
            None => panic!(
                "completion fired with no continuation for {}",
                self.scheduler.name()
            ),
        }
    }
}

impl std::fmt::Debug for PushContinuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushContinuation")
            .field("scheduler", &self.scheduler.name())
            .finish()
    }
}
