//! Thread Proxy
//!
//! A `ThreadProxy` owns one OS thread and the set of schedulers it serves.
//! Schedulers only see a [`ThreadRef`], a weak handle they use to wake the
//! thread; they never keep it alive.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread::{self, JoinHandle};

use crate::config::SUSPEND_THRESHOLD;
use crate::error::{Result, SchedError};
use crate::event::Event;
use crate::scheduler::{Scheduler, SchedulerId};

pub(crate) struct ProxyShared {
    name: String,
    do_work_event: Event,
    time_to_die: AtomicBool,
    schedulers: RwLock<Vec<Arc<dyn Scheduler>>>,
    /// Bumped on every attach/detach so the run loop knows to re-snapshot.
    epoch: AtomicU64,
    suspend_threshold: u32,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyShared {
    fn is_attached(&self, id: SchedulerId) -> bool {
        self.schedulers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|s| s.id() == id)
    }

    fn attach(self: &Arc<Self>, scheduler: Arc<dyn Scheduler>) {
        if self.is_attached(scheduler.id()) {
            return;
        }
        // Scheduler side first; it may unbind whichever thread it had.
        scheduler.attach_thread(ThreadRef {
            inner: Arc::downgrade(self),
        });
        {
            let mut schedulers = self.schedulers.write().unwrap_or_else(PoisonError::into_inner);
            if schedulers.iter().any(|s| s.id() == scheduler.id()) {
                return;
            }
            schedulers.push(Arc::clone(&scheduler));
        }
        self.epoch.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(thread = %self.name, scheduler = scheduler.name(), "attached to scheduler");
        self.do_work_event.trigger();
    }

    fn detach(self: &Arc<Self>, scheduler: &dyn Scheduler) {
        let removed = {
            let mut schedulers = self.schedulers.write().unwrap_or_else(PoisonError::into_inner);
            let before = schedulers.len();
            schedulers.retain(|s| s.id() != scheduler.id());
            before != schedulers.len()
        };
        if removed {
            self.epoch.fetch_add(1, Ordering::AcqRel);
            scheduler.detach_thread(&ThreadRef {
                inner: Arc::downgrade(self),
            });
            tracing::debug!(thread = %self.name, scheduler = scheduler.name(), "detached from scheduler");
        }
    }

    fn wait_for_completion(&self) {
        self.time_to_die.store(true, Ordering::Release);
        self.do_work_event.trigger();

        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(handle) = handle else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            // Asked to join ourselves from inside a task; the loop exits on
            // its own once it drains.
            tracing::warn!(thread = %self.name, "thread asked to join itself; detaching");
            return;
        }
        if handle.join().is_err() {
            tracing::warn!(thread = %self.name, "thread exited by panic");
        }
    }

    fn run(&self) {
        tracing::debug!(thread = %self.name, "thread proxy started");
        let mut snapshot: Vec<Arc<dyn Scheduler>> = Vec::new();
        let mut seen_epoch = None;

        loop {
            self.do_work_event.wait();

            let mut misses = 0u32;
            loop {
                let epoch = self.epoch.load(Ordering::Acquire);
                if seen_epoch != Some(epoch) {
                    snapshot = self
                        .schedulers
                        .read()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone();
                    seen_epoch = Some(epoch);
                }

                let mut has_work = false;
                for scheduler in &snapshot {
                    if let Some(task) = scheduler.next_queued_work() {
                        tracing::trace!(
                            thread = %self.name,
                            scheduler = scheduler.name(),
                            task = task.name().unwrap_or("unnamed"),
                            "executing task"
                        );
                        task.execute();
                        has_work = true;
                    }
                }

                if has_work {
                    misses = 0;
                    continue;
                }
                misses += 1;
                if misses > self.suspend_threshold {
                    break;
                }
                if misses * 2 < self.suspend_threshold {
                    std::hint::spin_loop();
                } else {
                    thread::yield_now();
                }
            }

            if self.time_to_die.load(Ordering::Acquire) {
                if self.no_work_to_run() {
                    break;
                }
                // Work landed after the last scan; go round again.
                self.do_work_event.trigger();
            }
        }
        tracing::debug!(thread = %self.name, "thread proxy exiting");
    }

    fn no_work_to_run(&self) -> bool {
        self.schedulers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .all(|scheduler| scheduler.is_empty_work())
    }
}

/// Weak handle to a thread proxy.
#[derive(Clone)]
pub struct ThreadRef {
    inner: Weak<ProxyShared>,
}

impl ThreadRef {
    /// Wake the thread. `false` if it no longer exists.
    pub fn resume(&self) -> bool {
        match self.inner.upgrade() {
            Some(shared) => {
                shared.do_work_event.trigger();
                true
            }
            None => false,
        }
    }

    pub fn name(&self) -> Option<String> {
        self.inner.upgrade().map(|shared| shared.name.clone())
    }

    pub fn ptr_eq(&self, other: &ThreadRef) -> bool {
        Weak::ptr_eq(&self.inner, &other.inner)
    }

    /// Attach the referenced thread to `scheduler` as well.
    pub fn attach_to_scheduler(&self, scheduler: Arc<dyn Scheduler>) -> bool {
        match self.inner.upgrade() {
            Some(shared) => {
                shared.attach(scheduler);
                true
            }
            None => false,
        }
    }

    /// Detach the referenced thread from `scheduler` on both sides.
    pub fn detach_from_scheduler(&self, scheduler: &dyn Scheduler) -> bool {
        match self.inner.upgrade() {
            Some(shared) => {
                shared.detach(scheduler);
                true
            }
            None => false,
        }
    }

    /// Stop and join the referenced thread, if it still exists.
    pub fn wait_for_completion(&self) {
        if let Some(shared) = self.inner.upgrade() {
            shared.wait_for_completion();
        }
    }
}

impl fmt::Debug for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRef")
            .field("name", &self.name())
            .finish()
    }
}

/// Owner of one OS thread running the pull-work loop.
pub struct ThreadProxy {
    shared: Arc<ProxyShared>,
}

impl ThreadProxy {
    /// Spawn a named thread with the given stack reservation.
    pub fn new(stack_size: usize, name: impl Into<String>) -> Result<Self> {
        Self::with_suspend_threshold(stack_size, name, SUSPEND_THRESHOLD)
    }

    pub fn with_suspend_threshold(
        stack_size: usize,
        name: impl Into<String>,
        suspend_threshold: u32,
    ) -> Result<Self> {
        let name = name.into();
        let shared = Arc::new(ProxyShared {
            name: name.clone(),
            do_work_event: Event::new(),
            time_to_die: AtomicBool::new(false),
            schedulers: RwLock::new(Vec::new()),
            epoch: AtomicU64::new(0),
            suspend_threshold,
            handle: Mutex::new(None),
        });

        let runner = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.clone())
            .stack_size(stack_size)
            .spawn(move || runner.run())
            .map_err(|source| SchedError::Spawn {
                name: name.clone(),
                source,
            })?;
        *shared.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        tracing::debug!(thread = %name, stack_size, "spawned thread proxy");
        Ok(Self { shared })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn thread_ref(&self) -> ThreadRef {
        ThreadRef {
            inner: Arc::downgrade(&self.shared),
        }
    }

    /// Record the scheduler on both sides and wake the thread.
    pub fn attach_to_scheduler(&self, scheduler: Arc<dyn Scheduler>) {
        self.shared.attach(scheduler);
    }

    pub fn detach_from_scheduler(&self, scheduler: &dyn Scheduler) {
        self.shared.detach(scheduler);
    }

    pub fn num_schedulers(&self) -> usize {
        self.shared
            .schedulers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn resume(&self) {
        self.shared.do_work_event.trigger();
    }

    /// Set the exit flag, wake the thread and join it once it drains.
    pub fn wait_for_completion(&self) {
        self.shared.wait_for_completion();
    }

    pub fn is_finished(&self) -> bool {
        self.shared
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for ThreadProxy {
    fn drop(&mut self) {
        self.wait_for_completion();
    }
}

impl fmt::Debug for ThreadProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadProxy")
            .field("name", &self.shared.name)
            .field("schedulers", &self.num_schedulers())
            .field("running", &!self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SingleScheduler;
    use crate::task::Task;
    use std::sync::atomic::AtomicU32;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_runs_tasks_of_attached_scheduler() {
        let proxy = ThreadProxy::new(256 * 1024, "proxy-test").unwrap();
        let scheduler = Arc::new(SingleScheduler::new("proxy-test"));
        proxy.attach_to_scheduler(scheduler.clone());
        assert_eq!(proxy.num_schedulers(), 1);

        let (tx, rx) = mpsc::channel();
        scheduler.push_fn(move || {
            tx.send(thread::current().name().map(str::to_owned)).unwrap();
        });
        let ran_on = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(ran_on.as_deref(), Some("proxy-test"));
    }

    #[test]
    fn test_wait_for_completion_drains_first() {
        let proxy = ThreadProxy::with_suspend_threshold(256 * 1024, "drain-test", 5).unwrap();
        let scheduler = Arc::new(SingleScheduler::new("drain-test"));
        let count = Arc::new(AtomicU32::new(0));
        proxy.attach_to_scheduler(scheduler.clone());

        for _ in 0..100 {
            let count = Arc::clone(&count);
            scheduler.push_fn(move || {
                count.fetch_add(1, Ordering::Relaxed);
            });
        }
        proxy.wait_for_completion();

        assert!(proxy.is_finished());
        assert_eq!(count.load(Ordering::Relaxed), 100);
    }

    /// Scheduler whose empty scans report in and then stall, so a test can
    /// push while the thread is past its last look at the queue.
    struct SlowScanScheduler {
        tasks: Mutex<std::collections::VecDeque<Task>>,
        empty_scans: Mutex<mpsc::Sender<()>>,
    }

    impl Scheduler for SlowScanScheduler {
        fn id(&self) -> SchedulerId {
            SchedulerId::MAX
        }

        fn name(&self) -> &str {
            "slow-scan"
        }

        fn push_task(&self, task: Task) {
            self.tasks.lock().unwrap().push_back(task);
        }

        fn next_queued_work(&self) -> Option<Task> {
            if let Some(task) = self.tasks.lock().unwrap().pop_front() {
                return Some(task);
            }
            let _ = self.empty_scans.lock().unwrap().send(());
            thread::sleep(Duration::from_millis(100));
            None
        }

        fn is_empty_work(&self) -> bool {
            self.tasks.lock().unwrap().is_empty()
        }

        fn attach_thread(&self, _thread: ThreadRef) {}

        fn detach_thread(&self, _thread: &ThreadRef) {}

        fn wait_for_completion_and_thread_exit(&self) {}
    }

    #[test]
    fn test_exit_runs_work_pushed_after_last_scan() {
        let (tx, rx) = mpsc::channel();
        let scheduler = Arc::new(SlowScanScheduler {
            tasks: Mutex::new(Default::default()),
            empty_scans: Mutex::new(tx),
        });
        // One scan per wake-up: the empty scan below is the thread's last.
        let proxy = ThreadProxy::with_suspend_threshold(256 * 1024, "late-push", 0).unwrap();
        proxy.attach_to_scheduler(scheduler.clone());

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let ran = Arc::new(AtomicU32::new(0));
        {
            let ran = Arc::clone(&ran);
            scheduler.push_task(Task::from_fn(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        proxy.wait_for_completion();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_empty_work());
    }

    #[test]
    fn test_detach_is_mutual() {
        let proxy = ThreadProxy::new(256 * 1024, "detach-test").unwrap();
        let scheduler = Arc::new(SingleScheduler::new("detach-test"));
        proxy.attach_to_scheduler(scheduler.clone());
        assert!(scheduler.thread().is_some());

        proxy.detach_from_scheduler(scheduler.as_ref());
        assert_eq!(proxy.num_schedulers(), 0);
        assert!(scheduler.thread().is_none());
    }

    #[test]
    fn test_thread_ref_outlived_by_scheduler() {
        let scheduler = Arc::new(SingleScheduler::new("orphan-test"));
        {
            let proxy = ThreadProxy::new(256 * 1024, "orphan-test").unwrap();
            proxy.attach_to_scheduler(scheduler.clone());
        }
        // The proxy is gone; pushing must not panic, the task just waits.
        scheduler.push_fn(|| {});
        assert!(!scheduler.is_empty_work());
        assert!(!scheduler.thread().is_some_and(|t| t.resume()));
    }
}
