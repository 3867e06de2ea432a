//! Stalling Worker Pool
//!
//! Workers share one [`StallingQueue`] and each sleep on their own event. A
//! push wakes exactly the worker the queue reports as stalled, or nobody when
//! every worker is already busy.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use strand_lockfree::{MAX_STALLING_WORKERS, StallingQueue};

use crate::error::{Result, SchedError};
use crate::event::Event;
use crate::task::Task;

struct StallingShared<const PRIORITIES: usize> {
    queue: StallingQueue<Task, PRIORITIES>,
    events: Vec<Event>,
    quit: AtomicBool,
}

impl<const PRIORITIES: usize> StallingShared<PRIORITIES> {
    fn run(&self, worker: u32) {
        tracing::debug!(worker, "stalling worker started");
        loop {
            match self.queue.pop(worker, true) {
                Some(task) => {
                    tracing::trace!(worker, task = task.name().unwrap_or("unnamed"), "executing task");
                    task.execute();
                }
                None => {
                    self.events[worker as usize].wait();
                    if self.quit.load(Ordering::Acquire) {
                        break;
                    }
                }
            }
        }
        // Shutdown may have interrupted a stall, so drain without registering.
        while let Some(task) = self.queue.steal() {
            task.execute();
        }
        tracing::debug!(worker, "stalling worker exiting");
    }
}

/// Pool of "any thread" workers with targeted wake-ups.
pub struct StallingWorkerPool<const PRIORITIES: usize> {
    shared: Arc<StallingShared<PRIORITIES>>,
    workers: Vec<JoinHandle<()>>,
}

impl<const PRIORITIES: usize> StallingWorkerPool<PRIORITIES> {
    pub fn new(num_workers: usize, stack_size: usize, name_prefix: &str) -> Result<Self> {
        if num_workers == 0 || num_workers > MAX_STALLING_WORKERS as usize {
            return Err(SchedError::InvalidConfig(format!(
                "stalling pool needs 1..={MAX_STALLING_WORKERS} workers, got {num_workers}"
            )));
        }

        let shared = Arc::new(StallingShared {
            queue: StallingQueue::new(),
            events: (0..num_workers).map(|_| Event::new()).collect(),
            quit: AtomicBool::new(false),
        });

        let mut pool = Self {
            shared,
            workers: Vec::with_capacity(num_workers),
        };
        for worker in 0..num_workers as u32 {
            let name = format!("{name_prefix}-{worker}");
            let shared = Arc::clone(&pool.shared);
            // On failure, `pool` drops and joins the workers spawned so far.
            let handle = thread::Builder::new()
                .name(name.clone())
                .stack_size(stack_size)
                .spawn(move || shared.run(worker))
                .map_err(|source| SchedError::Spawn { name, source })?;
            pool.workers.push(handle);
        }
        tracing::debug!(pool = name_prefix, workers = num_workers, "stalling pool created");
        Ok(pool)
    }

    /// Queue `task` at `priority` (0 is highest) and wake one stalled worker.
    pub fn push(&self, task: Task, priority: usize) {
        if let Some(worker) = self.shared.queue.push(task, priority) {
            self.shared.events[worker as usize].trigger();
        }
    }

    pub fn push_fn<F>(&self, priority: usize, body: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Task::from_fn(body), priority);
    }

    pub fn num_workers(&self) -> usize {
        self.shared.events.len()
    }

    /// Bitmask of workers currently asleep.
    pub fn stalled_mask(&self) -> u32 {
        self.shared.queue.stalled_mask()
    }

    /// Wake every worker, let them drain the queue, and join them.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.shared.quit.store(true, Ordering::Release);
        for event in &self.shared.events {
            event.trigger();
        }
        for handle in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("stalling-worker").to_owned();
            if handle.join().is_err() {
                tracing::warn!(thread = %name, "stalling worker exited by panic");
            }
        }
    }
}

impl<const PRIORITIES: usize> Drop for StallingWorkerPool<PRIORITIES> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
