//! Scheduler Configuration

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedError};

/// Consecutive empty scans before a thread proxy goes back to sleep.
pub const SUSPEND_THRESHOLD: u32 = 50;

/// Async worker pool size.
pub const DEFAULT_ASYNC_WORKERS: usize = 4;

/// Stack reserved for the Game, Render and RHI threads.
pub const DEFAULT_NAMED_STACK_SIZE: usize = 1024 * 1024;

/// Stack reserved for each pooled worker.
pub const DEFAULT_WORKER_STACK_SIZE: usize = 256 * 1024;

/// Logical cores reserved for the named threads.
const NAMED_THREAD_COUNT: usize = 3;

/// Number of logical cores, falling back to 4 when unknown.
pub fn logical_cores() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

/// Sync worker pool sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerCount {
    /// One worker per logical core left over after the named threads
    #[default]
    Auto,
    /// Exactly this many workers
    Fixed(usize),
}

impl WorkerCount {
    pub fn resolve(self) -> usize {
        match self {
            Self::Auto => {
                let cores = logical_cores();
                if cores > NAMED_THREAD_COUNT {
                    cores - NAMED_THREAD_COUNT
                } else {
                    cores
                }
            }
            Self::Fixed(count) => count,
        }
    }
}

/// Scheduler configuration options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Stack size of the Game, Render and RHI threads (bytes)
    pub named_stack_size: usize,

    /// Stack size of pooled worker threads (bytes)
    pub worker_stack_size: usize,

    /// Sync worker pool size
    pub sync_workers: WorkerCount,

    /// Async worker pool size
    pub async_workers: usize,

    /// Empty scans before a thread sleeps
    pub suspend_threshold: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            named_stack_size: DEFAULT_NAMED_STACK_SIZE,
            worker_stack_size: DEFAULT_WORKER_STACK_SIZE,
            sync_workers: WorkerCount::Auto,
            async_workers: DEFAULT_ASYNC_WORKERS,
            suspend_threshold: SUSPEND_THRESHOLD,
        }
    }
}

impl SchedulerConfig {
    pub fn with_named_stack_size(mut self, bytes: usize) -> Self {
        self.named_stack_size = bytes;
        self
    }

    pub fn with_worker_stack_size(mut self, bytes: usize) -> Self {
        self.worker_stack_size = bytes;
        self
    }

    pub fn with_sync_workers(mut self, count: WorkerCount) -> Self {
        self.sync_workers = count;
        self
    }

    pub fn with_async_workers(mut self, count: usize) -> Self {
        self.async_workers = count;
        self
    }

    pub fn with_suspend_threshold(mut self, threshold: u32) -> Self {
        self.suspend_threshold = threshold;
        self
    }

    /// Defaults overlaid with `STRAND_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Overlay values found through `lookup`; unparseable ones are ignored.
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parse<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "ignoring unparseable setting");
                    None
                }
            }
        }

        if let Some(count) = parse("STRAND_SYNC_WORKERS", lookup("STRAND_SYNC_WORKERS")) {
            self.sync_workers = WorkerCount::Fixed(count);
        }
        if let Some(count) = parse("STRAND_ASYNC_WORKERS", lookup("STRAND_ASYNC_WORKERS")) {
            self.async_workers = count;
        }
        if let Some(threshold) =
            parse("STRAND_SUSPEND_THRESHOLD", lookup("STRAND_SUSPEND_THRESHOLD"))
        {
            self.suspend_threshold = threshold;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync_workers == WorkerCount::Fixed(0) {
            return Err(SchedError::InvalidConfig("sync worker count must be non-zero".into()));
        }
        if self.async_workers == 0 {
            return Err(SchedError::InvalidConfig("async worker count must be non-zero".into()));
        }
        if self.suspend_threshold == 0 {
            return Err(SchedError::InvalidConfig("suspend threshold must be non-zero".into()));
        }
        Ok(())
    }
}
