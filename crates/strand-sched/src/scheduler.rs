//! Scheduler Hierarchy
//!
//! A scheduler is a lock-free FIFO of [`Task`]s plus the threads that drain
//! it. [`SingleScheduler`] is bound to exactly one thread; pushing wakes that
//! thread. [`PooledTaskScheduler`] is served by any number of threads and
//! wakes all of them on every push; the ones that find nothing go back to
//! sleep.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use strand_lockfree::LockFreeFifo;

use crate::task::Task;
use crate::thread::ThreadRef;

/// Scheduler queues advance their tagged words by a cache line's worth.
const QUEUE_ABA_STRIDE: u64 = 64;

/// Unique scheduler identifier
pub type SchedulerId = u64;

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

fn next_scheduler_id() -> SchedulerId {
    NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Queue of tasks drained by attached threads.
pub trait Scheduler: Send + Sync {
    fn id(&self) -> SchedulerId;

    fn name(&self) -> &str;

    /// Enqueue a task and wake the thread(s) serving this scheduler.
    fn push_task(&self, task: Task);

    /// Enqueue a closure.
    fn push_fn<F>(&self, body: F)
    where
        F: FnOnce() + Send + 'static,
        Self: Sized,
    {
        self.push_task(Task::from_fn(body));
    }

    /// Non-blocking pop.
    fn next_queued_work(&self) -> Option<Task>;

    fn is_empty_work(&self) -> bool;

    /// Scheduler side of an attach; called by the thread proxy.
    fn attach_thread(&self, thread: ThreadRef);

    /// Scheduler side of a detach; called by the thread proxy.
    fn detach_thread(&self, thread: &ThreadRef);

    /// Stop every attached thread once it has drained, and join it.
    fn wait_for_completion_and_thread_exit(&self);
}

/// Task FIFO shared by both scheduler kinds.
struct TaskQueue {
    owner: String,
    tasks: LockFreeFifo<Task>,
}

impl TaskQueue {
    fn new(owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            tasks: LockFreeFifo::with_aba_stride(QUEUE_ABA_STRIDE),
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        let mut abandoned = 0usize;
        while let Some(task) = self.tasks.pop() {
            task.abandon();
            abandoned += 1;
        }
        if abandoned > 0 {
            tracing::warn!(scheduler = %self.owner, abandoned, "dropped scheduler with queued tasks");
        }
    }
}

// ============================================================================
// SingleScheduler
// ============================================================================

/// Scheduler bound to one dedicated thread.
pub struct SingleScheduler {
    id: SchedulerId,
    name: String,
    queue: TaskQueue,
    thread: RwLock<Option<ThreadRef>>,
}

impl SingleScheduler {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: next_scheduler_id(),
            queue: TaskQueue::new(&name),
            name,
            thread: RwLock::new(None),
        }
    }

    /// The bound thread, if any.
    pub fn thread(&self) -> Option<ThreadRef> {
        self.thread
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Scheduler for SingleScheduler {
    fn id(&self) -> SchedulerId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn push_task(&self, task: Task) {
        self.queue.tasks.push(task);
        if let Some(thread) = self.thread.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
            thread.resume();
        }
    }

    fn next_queued_work(&self) -> Option<Task> {
        self.queue.tasks.pop()
    }

    fn is_empty_work(&self) -> bool {
        self.queue.tasks.is_empty()
    }

    /// Bind `thread`, unbinding the previous thread on both sides.
    fn attach_thread(&self, thread: ThreadRef) {
        let previous = self
            .thread
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(thread.clone());
        if let Some(previous) = previous.filter(|previous| !previous.ptr_eq(&thread)) {
            tracing::debug!(
                scheduler = %self.name,
                from = ?previous.name(),
                to = ?thread.name(),
                "single scheduler rebound"
            );
            // The slot already names the new thread, so the callback back
            // into `detach_thread` leaves it alone.
            previous.detach_from_scheduler(self);
        }
    }

    fn detach_thread(&self, thread: &ThreadRef) {
        let mut slot = self.thread.write().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|current| current.ptr_eq(thread)) {
            *slot = None;
        }
    }

    fn wait_for_completion_and_thread_exit(&self) {
        if let Some(thread) = self.thread() {
            thread.wait_for_completion();
        }
    }
}

impl std::fmt::Debug for SingleScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleScheduler")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("thread", &self.thread())
            .finish()
    }
}

// ============================================================================
// PooledTaskScheduler
// ============================================================================

/// Scheduler served by a set of threads, with indexed single-thread sub-targets.
pub struct PooledTaskScheduler {
    id: SchedulerId,
    name: String,
    queue: TaskQueue,
    threads: RwLock<Vec<ThreadRef>>,
    sub_schedulers: RwLock<Vec<Arc<SingleScheduler>>>,
}

impl PooledTaskScheduler {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: next_scheduler_id(),
            queue: TaskQueue::new(&name),
            name,
            threads: RwLock::new(Vec::new()),
            sub_schedulers: RwLock::new(Vec::new()),
        }
    }

    /// Register `scheduler` as a sub-target and let its thread help this pool.
    ///
    /// Returns the sub-target index for [`push_task_to`](Self::push_task_to).
    pub fn add_single_scheduler(self: &Arc<Self>, scheduler: Arc<SingleScheduler>) -> usize {
        if let Some(thread) = scheduler.thread() {
            thread.attach_to_scheduler(Arc::clone(self) as Arc<dyn Scheduler>);
        }
        let mut subs = self.sub_schedulers.write().unwrap_or_else(PoisonError::into_inner);
        subs.push(scheduler);
        subs.len() - 1
    }

    /// Route a task to one sub-target.
    ///
    /// # Panics
    /// When `index` is not a registered sub-target.
    pub fn push_task_to(&self, index: usize, task: Task) {
        let subs = self.sub_schedulers.read().unwrap_or_else(PoisonError::into_inner);
        match subs.get(index) {
            Some(scheduler) => scheduler.push_task(task),
            None => panic!(
                "{} has no sub-scheduler {index} ({} registered)",
                self.name,
                subs.len()
            ),
        }
    }

    pub fn num_schedulers(&self) -> usize {
        self.sub_schedulers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn num_threads(&self) -> usize {
        self.threads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Split `[0, total)` into bundles of `bundle_size` and push one task per
    /// bundle calling `body(start, size, bundle_id)`.
    ///
    /// The last bundle is clamped to `total`. Returns the number of bundles;
    /// joining them is up to the caller (see `CompletionCounter`).
    ///
    /// # Panics
    /// When `bundle_size` is zero.
    pub fn parallel_for<F>(&self, body: F, total: u32, bundle_size: u32) -> u32
    where
        F: Fn(u32, u32, u32) + Send + Sync + 'static,
    {
        assert!(bundle_size > 0, "parallel_for needs a non-zero bundle size");
        let bundles = total.div_ceil(bundle_size);
        let body = Arc::new(body);
        for bundle_id in 0..bundles {
            let start = bundle_id * bundle_size;
            let size = bundle_size.min(total - start);
            let body = Arc::clone(&body);
            self.push_task(Task::named("parallel-for", move || body(start, size, bundle_id)));
        }
        tracing::debug!(scheduler = %self.name, total, bundle_size, bundles, "parallel_for pushed");
        bundles
    }
}

impl Scheduler for PooledTaskScheduler {
    fn id(&self) -> SchedulerId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn push_task(&self, task: Task) {
        self.queue.tasks.push(task);
        for thread in self.threads.read().unwrap_or_else(PoisonError::into_inner).iter() {
            thread.resume();
        }
    }

    fn next_queued_work(&self) -> Option<Task> {
        self.queue.tasks.pop()
    }

    fn is_empty_work(&self) -> bool {
        self.queue.tasks.is_empty()
    }

    fn attach_thread(&self, thread: ThreadRef) {
        let mut threads = self.threads.write().unwrap_or_else(PoisonError::into_inner);
        if !threads.iter().any(|t| t.ptr_eq(&thread)) {
            threads.push(thread);
        }
    }

    fn detach_thread(&self, thread: &ThreadRef) {
        self.threads
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|t| !t.ptr_eq(thread));
    }

    fn wait_for_completion_and_thread_exit(&self) {
        let threads = self
            .threads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for thread in threads {
            thread.wait_for_completion();
        }
    }
}

impl std::fmt::Debug for PooledTaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledTaskScheduler")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("threads", &self.num_threads())
            .field("schedulers", &self.num_schedulers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::{ThreadPoolBase, ThreadProxy};
    use std::sync::Mutex;
    use std::sync::mpsc;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn test_queue_without_threads() {
        let scheduler = SingleScheduler::new("idle");
        assert!(scheduler.is_empty_work());
        scheduler.push_fn(|| {});
        assert!(!scheduler.is_empty_work());
        assert!(scheduler.next_queued_work().is_some());
        assert!(scheduler.next_queued_work().is_none());
    }

    #[test]
    fn test_dropping_queued_work_abandons_it() {
        struct Flag(Arc<AtomicU32>);
        impl crate::task::Work for Flag {
            fn do_work(&mut self) {}
            fn abandon(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let abandoned = Arc::new(AtomicU32::new(0));
        {
            let scheduler = PooledTaskScheduler::new("doomed");
            for _ in 0..3 {
                scheduler.push_task(Task::from_work(Flag(Arc::clone(&abandoned))));
            }
        }
        assert_eq!(abandoned.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_single_scheduler_rebinds_to_new_thread() {
        let scheduler = Arc::new(SingleScheduler::new("exclusive"));
        let first = ThreadProxy::new(256 * 1024, "exclusive-1").unwrap();
        let second = ThreadProxy::new(256 * 1024, "exclusive-2").unwrap();
        first.attach_to_scheduler(scheduler.clone());
        second.attach_to_scheduler(scheduler.clone());

        assert_eq!(first.num_schedulers(), 0);
        assert_eq!(second.num_schedulers(), 1);
        let bound = scheduler.thread().unwrap();
        assert!(bound.ptr_eq(&second.thread_ref()));

        let (tx, rx) = mpsc::channel();
        scheduler.push_fn(move || {
            tx.send(std::thread::current().name().map(str::to_owned)).unwrap();
        });
        let ran_on = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(ran_on.as_deref(), Some("exclusive-2"));
    }

    #[test]
    fn test_rebinding_the_same_thread_keeps_it() {
        let scheduler = Arc::new(SingleScheduler::new("same"));
        let proxy = ThreadProxy::new(256 * 1024, "same").unwrap();
        proxy.attach_to_scheduler(scheduler.clone());
        proxy.thread_ref().attach_to_scheduler(scheduler.clone());

        assert_eq!(proxy.num_schedulers(), 1);
        assert!(scheduler.thread().unwrap().ptr_eq(&proxy.thread_ref()));
    }

    #[test]
    fn test_parallel_for_covers_range_once() {
        let pool = ThreadPoolBase::new(3, 256 * 1024, "pf-test").unwrap();
        let scheduler = Arc::new(PooledTaskScheduler::new("pf-test"));
        pool.attach_to_scheduler(scheduler.clone());
        assert_eq!(scheduler.num_threads(), 3);

        let hits: Arc<Vec<AtomicU32>> = Arc::new((0..103).map(|_| AtomicU32::new(0)).collect());
        let bundles_seen = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);

        let body = {
            let hits = Arc::clone(&hits);
            let bundles_seen = Arc::clone(&bundles_seen);
            move |start: u32, size: u32, bundle_id: u32| {
                for i in start..start + size {
                    hits[i as usize].fetch_add(1, Ordering::Relaxed);
                }
                bundles_seen.lock().unwrap().push((bundle_id, size));
                tx.lock().unwrap().send(()).unwrap();
            }
        };
        let bundles = scheduler.parallel_for(body, 103, 10);
        assert_eq!(bundles, 11);

        for _ in 0..bundles {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert!(hits.iter().all(|h| h.load(Ordering::Relaxed) == 1));
        let mut seen = bundles_seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen.len(), 11);
        assert_eq!(seen[10], (10, 3));
    }

    #[test]
    fn test_parallel_for_empty_range() {
        let scheduler = PooledTaskScheduler::new("pf-empty");
        assert_eq!(scheduler.parallel_for(|_, _, _| {}, 0, 8), 0);
        assert!(scheduler.is_empty_work());
    }

    #[test]
    #[should_panic(expected = "non-zero bundle size")]
    fn test_parallel_for_zero_bundle() {
        let scheduler = PooledTaskScheduler::new("pf-zero");
        scheduler.parallel_for(|_, _, _| {}, 10, 0);
    }

    #[test]
    fn test_sub_scheduler_routing() {
        let named = ThreadProxy::new(256 * 1024, "sub-target").unwrap();
        let single = Arc::new(SingleScheduler::new("sub-target"));
        named.attach_to_scheduler(single.clone());

        let pool = Arc::new(PooledTaskScheduler::new("with-subs"));
        let index = pool.add_single_scheduler(single.clone());
        assert_eq!(index, 0);
        assert_eq!(pool.num_schedulers(), 1);
        // The named thread now serves the pool as well.
        assert_eq!(pool.num_threads(), 1);
        assert_eq!(named.num_schedulers(), 2);

        let (tx, rx) = mpsc::channel();
        pool.push_task_to(
            index,
            Task::from_fn(move || {
                tx.send(std::thread::current().name().map(str::to_owned)).unwrap();
            }),
        );
        let ran_on = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(ran_on.as_deref(), Some("sub-target"));
    }

    #[test]
    #[should_panic(expected = "has no sub-scheduler")]
    fn test_push_to_unknown_sub_scheduler() {
        let pool = PooledTaskScheduler::new("no-subs");
        pool.push_task_to(0, Task::from_fn(|| {}));
    }
}
