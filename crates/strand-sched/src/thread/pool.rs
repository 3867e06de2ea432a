//! Thread Pool
//!
//! A fixed set of thread proxies created together and attached en masse.

use std::sync::Arc;

use crate::config::SUSPEND_THRESHOLD;
use crate::error::Result;
use crate::scheduler::Scheduler;
use crate::thread::ThreadProxy;

/// Fixed-size collection of thread proxies
pub struct ThreadPoolBase {
    /// Worker threads
    threads: Vec<ThreadProxy>,
    /// Name prefix, workers are `{prefix}-{index}`
    name_prefix: String,
}

impl std::fmt::Debug for ThreadPoolBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPoolBase")
            .field("name_prefix", &self.name_prefix)
            .field("threads", &self.threads)
            .finish()
    }
}

impl ThreadPoolBase {
    /// Spawn `num_threads` proxies named `{name_prefix}-{index}`.
    pub fn new(num_threads: usize, stack_size: usize, name_prefix: &str) -> Result<Self> {
        Self::with_suspend_threshold(num_threads, stack_size, name_prefix, SUSPEND_THRESHOLD)
    }

    pub fn with_suspend_threshold(
        num_threads: usize,
        stack_size: usize,
        name_prefix: &str,
        suspend_threshold: u32,
    ) -> Result<Self> {
        let threads = (0..num_threads)
            .map(|index| {
                ThreadProxy::with_suspend_threshold(
                    stack_size,
                    format!("{name_prefix}-{index}"),
                    suspend_threshold,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(pool = name_prefix, threads = num_threads, "thread pool created");
        Ok(Self {
            threads,
            name_prefix: name_prefix.to_string(),
        })
    }

    /// Attach every thread to `scheduler`.
    pub fn attach_to_scheduler(&self, scheduler: Arc<dyn Scheduler>) {
        for thread in &self.threads {
            thread.attach_to_scheduler(Arc::clone(&scheduler));
        }
    }

    /// Attach one thread to `scheduler`.
    ///
    /// # Panics
    /// When `index` is out of range.
    pub fn attach_thread_to_scheduler(&self, index: usize, scheduler: Arc<dyn Scheduler>) {
        self.threads[index].attach_to_scheduler(scheduler);
    }

    pub fn detach_from_scheduler(&self, scheduler: &dyn Scheduler) {
        for thread in &self.threads {
            thread.detach_from_scheduler(scheduler);
        }
    }

    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }

    pub fn thread(&self, index: usize) -> Option<&ThreadProxy> {
        self.threads.get(index)
    }

    pub fn name_prefix(&self) -> &str {
        &self.name_prefix
    }

    /// Stop and join every thread; each drains its schedulers first.
    pub fn wait_for_completion(&self) {
        for thread in &self.threads {
            thread.wait_for_completion();
        }
    }
}
