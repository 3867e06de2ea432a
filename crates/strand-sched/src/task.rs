//! Tasks
//!
//! A [`Task`] is what schedulers queue and threads execute. The set of task
//! kinds is closed: a one-shot closure, a node of a task graph, or any user
//! type implementing [`Work`].

use std::borrow::Cow;
use std::fmt;

use crate::graph::GraphTask;

/// A unit of work with a work method.
pub trait Work: Send {
    /// Run the work. Graph nodes run once per submitted frame.
    fn do_work(&mut self);

    /// Called instead of `do_work` when the task is discarded unexecuted.
    fn abandon(&mut self) {}

    /// Debug name used in trace logs.
    fn name(&self) -> Option<&str> {
        None
    }
}

/// Adapts a named closure to [`Work`].
pub struct FnWork<F> {
    name: Cow<'static, str>,
    body: F,
}

impl<F: FnMut() + Send> FnWork<F> {
    pub fn new(name: impl Into<Cow<'static, str>>, body: F) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }
}

impl<F: FnMut() + Send> Work for FnWork<F> {
    fn do_work(&mut self) {
        (self.body)()
    }

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

/// One queued unit of work
pub enum Task {
    /// One-shot closure
    Inline {
        name: Option<Cow<'static, str>>,
        body: Box<dyn FnOnce() + Send>,
    },
    /// Node of a submitted task graph
    Graph(GraphTask),
    /// User type with a work method
    User(Box<dyn Work>),
}

impl Task {
    pub fn from_fn<F>(body: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::Inline {
            name: None,
            body: Box::new(body),
        }
    }

    pub fn named<F>(name: impl Into<Cow<'static, str>>, body: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::Inline {
            name: Some(name.into()),
            body: Box::new(body),
        }
    }

    pub fn from_work(work: impl Work + 'static) -> Self {
        Self::User(Box::new(work))
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Inline { name, .. } => name.as_deref(),
            Self::Graph(task) => task.name(),
            Self::User(work) => work.name(),
        }
    }

    /// Run the task on the calling thread.
    pub fn execute(self) {
        match self {
            Self::Inline { body, .. } => body(),
            Self::Graph(task) => task.execute(),
            Self::User(mut work) => work.do_work(),
        }
    }

    /// Discard the task without running it.
    pub fn abandon(self) {
        match self {
            Self::Inline { .. } => {}
            Self::Graph(task) => task.abandon(),
            Self::User(mut work) => work.abandon(),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Inline { .. } => "inline",
            Self::Graph(_) => "graph",
            Self::User(_) => "user",
        };
        f.debug_struct("Task")
            .field("kind", &kind)
            .field("name", &self.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counting {
        runs: Arc<AtomicU32>,
        abandoned: Arc<AtomicU32>,
    }

    impl Work for Counting {
        fn do_work(&mut self) {
            self.runs.fetch_add(1, Ordering::Relaxed);
        }

        fn abandon(&mut self) {
            self.abandoned.fetch_add(1, Ordering::Relaxed);
        }

        fn name(&self) -> Option<&str> {
            Some("counting")
        }
    }

    #[test]
    fn test_inline_task() {
        let hits = Arc::new(AtomicU32::new(0));
        let task = {
            let hits = Arc::clone(&hits);
            Task::named("bump", move || {
                hits.fetch_add(1, Ordering::Relaxed);
            })
        };
        assert_eq!(task.name(), Some("bump"));
        task.execute();
        assert_eq!(hits.load(Ordering::Relaxed), 1);

        assert_eq!(Task::from_fn(|| {}).name(), None);
    }

    #[test]
    fn test_user_task_execute_and_abandon() {
        let runs = Arc::new(AtomicU32::new(0));
        let abandoned = Arc::new(AtomicU32::new(0));
        let make = || {
            Task::from_work(Counting {
                runs: Arc::clone(&runs),
                abandoned: Arc::clone(&abandoned),
            })
        };

        let task = make();
        assert_eq!(task.name(), Some("counting"));
        task.execute();
        make().abandon();

        assert_eq!(runs.load(Ordering::Relaxed), 1);
        assert_eq!(abandoned.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_fn_work_is_reusable() {
        let mut calls = 0;
        let mut work = FnWork::new("tick", || calls += 1);
        work.do_work();
        work.do_work();
        assert_eq!(work.name(), Some("tick"));
        drop(work);
        assert_eq!(calls, 2);
    }
}
