//! Process-wide scheduler lifecycle
//!
//! One test per binary touches the global manager, so the whole lifecycle
//! lives in a single test.

use std::sync::Arc;
use std::time::Duration;

use strand_sched::{
    CompletionCounter, Event, SchedError, Scheduler, SchedulerConfig, TaskSchedulerManager,
    TriggerEvent, WorkerCount,
};

#[test]
fn test_manager_lifecycle() {
    assert!(!TaskSchedulerManager::is_started());
    assert!(matches!(
        TaskSchedulerManager::init_worker_threads(),
        Err(SchedError::NotStarted(_))
    ));

    let config = SchedulerConfig::default()
        .with_sync_workers(WorkerCount::Fixed(2))
        .with_async_workers(2);
    TaskSchedulerManager::start_up(config.clone()).unwrap();
    assert!(matches!(
        TaskSchedulerManager::start_up(config),
        Err(SchedError::AlreadyStarted(_))
    ));

    // Named threads work before the pools exist.
    let done = Arc::new(Event::new());
    {
        let done = Arc::clone(&done);
        TaskSchedulerManager::game_scheduler().push_fn(move || done.trigger());
    }
    assert!(done.wait_timeout(Duration::from_secs(10)));
    assert!(TaskSchedulerManager::context().unwrap().sync_workers().is_err());

    TaskSchedulerManager::init_worker_threads().unwrap();
    let sync_workers = TaskSchedulerManager::sync_workers();
    assert_eq!(sync_workers.num_threads(), 2);
    assert_eq!(TaskSchedulerManager::async_workers().num_threads(), 2);

    let counter = Arc::new(CompletionCounter::new(TriggerEvent::default()));
    counter.promise(100);
    for _ in 0..100 {
        let counter = Arc::clone(&counter);
        sync_workers.push_fn(move || counter.notify());
    }
    counter.hook().wait();

    TaskSchedulerManager::shut_down().unwrap();
    assert!(!TaskSchedulerManager::is_started());
    assert!(matches!(
        TaskSchedulerManager::shut_down(),
        Err(SchedError::NotStarted(_))
    ));
}
