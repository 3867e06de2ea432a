//! Scheduler Context
//!
//! The named schedulers (Game, Render, RHI) and the sync/async worker pools,
//! with their threads, live in one [`SchedulerContext`]. Its lifecycle has
//! two phases: `start_up` spawns the named threads, `init_worker_threads`
//! spawns the pools. `shut_down` drains and joins everything.
//!
//! [`TaskSchedulerManager`] keeps at most one context process-wide for code
//! that cannot have one passed in.

use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedError};
use crate::scheduler::{PooledTaskScheduler, Scheduler, SingleScheduler};
use crate::thread::{ThreadPoolBase, ThreadProxy};

/// Name of each dedicated thread, in start-up order.
pub const GAME_THREAD: &str = "game";
pub const RENDER_THREAD: &str = "render";
pub const RHI_THREAD: &str = "rhi";
pub const SYNC_WORKER_PREFIX: &str = "sync-worker";
pub const ASYNC_WORKER_PREFIX: &str = "async-worker";

struct WorkerPools {
    sync_workers: Arc<PooledTaskScheduler>,
    async_workers: Arc<PooledTaskScheduler>,
}

/// Every scheduler and thread of one engine instance
pub struct SchedulerContext {
    config: SchedulerConfig,
    game: Arc<SingleScheduler>,
    render: Arc<SingleScheduler>,
    rhi: Arc<SingleScheduler>,
    workers: OnceLock<WorkerPools>,
    named_threads: Mutex<Vec<ThreadProxy>>,
    pools: Mutex<Vec<ThreadPoolBase>>,
}

impl SchedulerContext {
    /// Validate `config` and spawn the Game, Render and RHI threads.
    pub fn start_up(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;

        let game = Arc::new(SingleScheduler::new(GAME_THREAD));
        let render = Arc::new(SingleScheduler::new(RENDER_THREAD));
        let rhi = Arc::new(SingleScheduler::new(RHI_THREAD));

        let mut named_threads = Vec::with_capacity(3);
        for scheduler in [&game, &render, &rhi] {
            let proxy = ThreadProxy::with_suspend_threshold(
                config.named_stack_size,
                scheduler.name(),
                config.suspend_threshold,
            )?;
            proxy.attach_to_scheduler(Arc::clone(scheduler) as Arc<dyn Scheduler>);
            named_threads.push(proxy);
        }

        tracing::debug!("scheduler context started");
        Ok(Self {
            config,
            game,
            render,
            rhi,
            workers: OnceLock::new(),
            named_threads: Mutex::new(named_threads),
            pools: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the sync and async worker pools.
    pub fn init_worker_threads(&self) -> Result<()> {
        // Holding the pool list serializes concurrent callers.
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        if self.workers.get().is_some() {
            return Err(SchedError::AlreadyStarted("worker threads"));
        }

        let sync_count = self.config.sync_workers.resolve();
        let sync_pool = ThreadPoolBase::with_suspend_threshold(
            sync_count,
            self.config.worker_stack_size,
            SYNC_WORKER_PREFIX,
            self.config.suspend_threshold,
        )?;
        let async_pool = ThreadPoolBase::with_suspend_threshold(
            self.config.async_workers,
            self.config.worker_stack_size,
            ASYNC_WORKER_PREFIX,
            self.config.suspend_threshold,
        )?;

        let sync_workers = Arc::new(PooledTaskScheduler::new(SYNC_WORKER_PREFIX));
        let async_workers = Arc::new(PooledTaskScheduler::new(ASYNC_WORKER_PREFIX));
        sync_pool.attach_to_scheduler(sync_workers.clone());
        async_pool.attach_to_scheduler(async_workers.clone());
        pools.push(sync_pool);
        pools.push(async_pool);

        // Cannot fail: checked above under the same lock.
        let _ = self.workers.set(WorkerPools {
            sync_workers,
            async_workers,
        });
        tracing::info!(
            sync_workers = sync_count,
            async_workers = self.config.async_workers,
            "worker threads started"
        );
        Ok(())
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn game_scheduler(&self) -> &Arc<SingleScheduler> {
        &self.game
    }

    pub fn render_scheduler(&self) -> &Arc<SingleScheduler> {
        &self.render
    }

    pub fn rhi_scheduler(&self) -> &Arc<SingleScheduler> {
        &self.rhi
    }

    pub fn sync_workers(&self) -> Result<&Arc<PooledTaskScheduler>> {
        self.workers
            .get()
            .map(|pools| &pools.sync_workers)
            .ok_or(SchedError::NotStarted("worker threads"))
    }

    pub fn async_workers(&self) -> Result<&Arc<PooledTaskScheduler>> {
        self.workers
            .get()
            .map(|pools| &pools.async_workers)
            .ok_or(SchedError::NotStarted("worker threads"))
    }

    /// Drain and join every thread: worker pools first, then the named threads.
    ///
    /// Must not be called from one of the context's own threads.
    pub fn shut_down(&self) {
        let pools: Vec<_> = self
            .pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for pool in &pools {
            pool.wait_for_completion();
        }
        drop(pools);

        let named: Vec<_> = self
            .named_threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for thread in &named {
            thread.wait_for_completion();
        }
        tracing::debug!("scheduler context shut down");
    }
}

impl Drop for SchedulerContext {
    fn drop(&mut self) {
        self.shut_down();
    }
}

impl std::fmt::Debug for SchedulerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerContext")
            .field("config", &self.config)
            .field("workers_started", &self.workers.get().is_some())
            .finish()
    }
}

// ============================================================================
// Process-wide instance
// ============================================================================

static CONTEXT: RwLock<Option<Arc<SchedulerContext>>> = RwLock::new(None);

/// Process-wide access to one [`SchedulerContext`].
pub struct TaskSchedulerManager;

impl TaskSchedulerManager {
    pub fn start_up(config: SchedulerConfig) -> Result<()> {
        let mut slot = CONTEXT.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(SchedError::AlreadyStarted("task scheduler manager"));
        }
        *slot = Some(Arc::new(SchedulerContext::start_up(config)?));
        Ok(())
    }

    pub fn init_worker_threads() -> Result<()> {
        Self::context()?.init_worker_threads()
    }

    /// Remove the process-wide context and shut it down.
    pub fn shut_down() -> Result<()> {
        let context = CONTEXT
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(SchedError::NotStarted("task scheduler manager"))?;
        context.shut_down();
        Ok(())
    }

    pub fn is_started() -> bool {
        CONTEXT
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn context() -> Result<Arc<SchedulerContext>> {
        CONTEXT
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(SchedError::NotStarted("task scheduler manager"))
    }

    /// # Panics
    /// When the manager has not been started.
    pub fn game_scheduler() -> Arc<SingleScheduler> {
        Arc::clone(Self::started().game_scheduler())
    }

    /// # Panics
    /// When the manager has not been started.
    pub fn render_scheduler() -> Arc<SingleScheduler> {
        Arc::clone(Self::started().render_scheduler())
    }

    /// # Panics
    /// When the manager has not been started.
    pub fn rhi_scheduler() -> Arc<SingleScheduler> {
        Arc::clone(Self::started().rhi_scheduler())
    }

    /// # Panics
    /// When the worker threads have not been started.
    pub fn sync_workers() -> Arc<PooledTaskScheduler> {
        match Self::started().sync_workers() {
            Ok(pool) => Arc::clone(pool),
            Err(err) => panic!("{err}"),
        }
    }

    /// # Panics
    /// When the worker threads have not been started.
    pub fn async_workers() -> Arc<PooledTaskScheduler> {
        match Self::started().async_workers() {
            Ok(pool) => Arc::clone(pool),
            Err(err) => panic!("{err}"),
        }
    }

    fn started() -> Arc<SchedulerContext> {
        match Self::context() {
            Ok(context) => context,
            Err(err) => panic!("{err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerCount;

    fn small_config() -> SchedulerConfig {
        SchedulerConfig::default()
            .with_sync_workers(WorkerCount::Fixed(2))
            .with_async_workers(1)
            .with_named_stack_size(256 * 1024)
    }

    #[test]
    fn test_two_phase_start() {
        let context = SchedulerContext::start_up(small_config()).unwrap();
        assert!(matches!(context.sync_workers(), Err(SchedError::NotStarted(_))));
        assert!(context.game_scheduler().thread().is_some());

        context.init_worker_threads().unwrap();
        assert_eq!(context.sync_workers().unwrap().num_threads(), 2);
        assert_eq!(context.async_workers().unwrap().num_threads(), 1);
        assert!(matches!(
            context.init_worker_threads(),
            Err(SchedError::AlreadyStarted(_))
        ));

        context.shut_down();
        assert!(context.game_scheduler().thread().is_some_and(|t| t.name().is_none()));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = small_config().with_async_workers(0);
        assert!(matches!(
            SchedulerContext::start_up(config),
            Err(SchedError::InvalidConfig(_))
        ));
    }
}
