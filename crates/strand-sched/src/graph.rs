//! Task Graph
//!
//! A DAG of [`Work`] items run on a scheduler in dependency order. Each node
//! moves `Wait -> Ready -> Completed`: it is pushed to the scheduler only once
//! every predecessor has completed, and completing it counts down each
//! successor.
//!
//! A graph is built once and replayed frame after frame: `submit` runs it,
//! `reset` waits for the frame to drain and returns every node to `Wait`
//! keeping the topology, `wait_and_reset` also drops the nodes.
//!
//! Waiting on a graph from one of the threads that executes it deadlocks.

use std::borrow::Cow;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};

use crate::scheduler::Scheduler;
use crate::task::{FnWork, Task, Work};

/// Index of a node within its graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Node lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeState {
    /// Waiting on predecessors (or on the next submit)
    Wait = 0,
    /// Pushed to the scheduler
    Ready = 1,
    /// Work executed, successors notified
    Completed = 2,
}

impl NodeState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Wait,
            1 => Self::Ready,
            2 => Self::Completed,
            _ => unreachable!("invalid node state {raw}"),
        }
    }
}

struct TaskGraphNode {
    work: Mutex<Box<dyn Work>>,
    name: Option<Arc<str>>,
    predecessors: Vec<NodeId>,
    successors: Vec<NodeId>,
    predecessor_count: AtomicU32,
    state: AtomicU8,
}

impl TaskGraphNode {
    fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Acquire))
    }
}

pub(crate) struct GraphShared {
    name: String,
    scheduler: Arc<dyn Scheduler>,
    nodes: RwLock<Vec<TaskGraphNode>>,
    /// Nodes of the current frame not yet completed.
    pending: AtomicU32,
    in_flight: Mutex<bool>,
    drained: Condvar,
    frames: AtomicU64,
}

impl GraphShared {
    fn lock_in_flight(&self) -> MutexGuard<'_, bool> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn make_ready(self: &Arc<Self>, nodes: &[TaskGraphNode], id: NodeId) {
        let node = &nodes[id.index()];
        if let Err(state) = node.state.compare_exchange(
            NodeState::Wait as u8,
            NodeState::Ready as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            panic!(
                "graph {} node {} made ready while {:?}",
                self.name,
                id.index(),
                NodeState::from_u8(state)
            );
        }
        self.scheduler.push_task(Task::Graph(GraphTask {
            graph: Arc::clone(self),
            node: id,
            name: node.name.clone(),
        }));
    }

    fn execute(self: &Arc<Self>, id: NodeId) {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        let node = &nodes[id.index()];
        let state = node.state();
        assert_eq!(
            state,
            NodeState::Ready,
            "graph {} node {} executed while {state:?}",
            self.name,
            id.index()
        );

        node.work
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .do_work();
        node.state.store(NodeState::Completed as u8, Ordering::Release);

        for &successor in &node.successors {
            let remaining = nodes[successor.index()]
                .predecessor_count
                .fetch_sub(1, Ordering::AcqRel);
            debug_assert!(remaining > 0, "graph {} node {} over-notified", self.name, successor.index());
            if remaining == 1 {
                self.make_ready(&nodes, successor);
            }
        }
        drop(nodes);

        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut in_flight = self.lock_in_flight();
            *in_flight = false;
            self.drained.notify_all();
            tracing::debug!(graph = %self.name, frame = self.frames.load(Ordering::Relaxed), "graph frame drained");
        }
    }
}

/// Scheduler task running one graph node.
pub struct GraphTask {
    graph: Arc<GraphShared>,
    node: NodeId,
    name: Option<Arc<str>>,
}

impl GraphTask {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn execute(self) {
        self.graph.execute(self.node);
    }

    pub(crate) fn abandon(self) {
        tracing::warn!(
            graph = %self.graph.name,
            node = self.node.index(),
            "graph node abandoned; its frame will never drain"
        );
    }
}

/// Handle used to build, submit and recycle a task graph
pub struct TaskGraphProxy {
    shared: Arc<GraphShared>,
}

impl TaskGraphProxy {
    /// Empty graph whose nodes run on `scheduler`.
    pub fn new(name: impl Into<String>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            shared: Arc::new(GraphShared {
                name: name.into(),
                scheduler,
                nodes: RwLock::new(Vec::new()),
                pending: AtomicU32::new(0),
                in_flight: Mutex::new(false),
                drained: Condvar::new(),
                frames: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Add a node that runs after every node in `predecessors`.
    ///
    /// # Panics
    /// When a predecessor was not pushed to this graph, or a frame is in
    /// flight.
    pub fn push_task(&self, work: impl Work + 'static, predecessors: &[NodeId]) -> NodeId {
        let in_flight = self.shared.lock_in_flight();
        assert!(
            !*in_flight,
            "cannot push to graph {} while a frame is in flight",
            self.shared.name
        );

        let mut nodes = self.shared.nodes.write().unwrap_or_else(PoisonError::into_inner);
        let id = NodeId(nodes.len() as u32);
        let mut predecessors = predecessors.to_vec();
        predecessors.sort_unstable();
        predecessors.dedup();
        for predecessor in &predecessors {
            assert!(
                predecessor.index() < nodes.len(),
                "predecessor {} of graph {} node {} has not been pushed",
                predecessor.index(),
                self.shared.name,
                id.index()
            );
        }
        for predecessor in &predecessors {
            nodes[predecessor.index()].successors.push(id);
        }

        let name = work.name().map(Arc::from);
        nodes.push(TaskGraphNode {
            work: Mutex::new(Box::new(work) as Box<dyn Work>),
            name,
            predecessors,
            successors: Vec::new(),
            predecessor_count: AtomicU32::new(0),
            state: AtomicU8::new(NodeState::Wait as u8),
        });
        id
    }

    /// Add a named closure node.
    pub fn push_fn<F>(
        &self,
        name: impl Into<Cow<'static, str>>,
        body: F,
        predecessors: &[NodeId],
    ) -> NodeId
    where
        F: FnMut() + Send + 'static,
    {
        self.push_task(FnWork::new(name, body), predecessors)
    }

    /// Start a frame: arm the countdowns and push every root.
    ///
    /// # Panics
    /// When a frame is already in flight, or the previous frame was not reset.
    pub fn submit(&self) {
        let mut in_flight = self.shared.lock_in_flight();
        assert!(
            !*in_flight,
            "graph {} submitted while a frame is in flight",
            self.shared.name
        );
        let nodes = self.shared.nodes.read().unwrap_or_else(PoisonError::into_inner);
        if nodes.is_empty() {
            return;
        }
        for (index, node) in nodes.iter().enumerate() {
            let state = node.state();
            assert_eq!(
                state,
                NodeState::Wait,
                "graph {} node {index} found {state:?} on submit; reset the graph first",
                self.shared.name
            );
            node.predecessor_count
                .store(node.predecessors.len() as u32, Ordering::Relaxed);
        }
        self.shared.pending.store(nodes.len() as u32, Ordering::Release);
        *in_flight = true;
        drop(in_flight);

        let frame = self.shared.frames.fetch_add(1, Ordering::Relaxed) + 1;
        let mut roots = 0;
        for (index, node) in nodes.iter().enumerate() {
            // Roots are chosen by topology, not by the live count, which
            // completing roots may already be driving to zero elsewhere.
            if node.predecessors.is_empty() {
                self.shared.make_ready(&nodes, NodeId(index as u32));
                roots += 1;
            }
        }
        tracing::debug!(graph = %self.shared.name, frame, nodes = nodes.len(), roots, "graph submitted");
    }

    /// Block until the current frame has drained.
    pub fn wait(&self) {
        let mut in_flight = self.shared.lock_in_flight();
        while *in_flight {
            in_flight = self
                .shared
                .drained
                .wait(in_flight)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wait for the frame, then return every node to `Wait` for replay.
    pub fn reset(&self) {
        self.wait();
        let in_flight = self.shared.lock_in_flight();
        assert!(!*in_flight, "graph {} reset while a frame is in flight", self.shared.name);
        let nodes = self.shared.nodes.read().unwrap_or_else(PoisonError::into_inner);
        for node in nodes.iter() {
            node.state.store(NodeState::Wait as u8, Ordering::Release);
            node.predecessor_count.store(0, Ordering::Relaxed);
        }
        tracing::debug!(graph = %self.shared.name, nodes = nodes.len(), "graph reset");
    }

    /// Wait for the frame, then drop every node.
    pub fn wait_and_reset(&self) {
        self.wait();
        let in_flight = self.shared.lock_in_flight();
        assert!(!*in_flight, "graph {} reset while a frame is in flight", self.shared.name);
        self.shared
            .nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::debug!(graph = %self.shared.name, "graph cleared");
    }

    pub fn len(&self) -> usize {
        self.shared
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_in_flight(&self) -> bool {
        *self.shared.lock_in_flight()
    }

    /// Frames submitted so far.
    pub fn frames_submitted(&self) -> u64 {
        self.shared.frames.load(Ordering::Relaxed)
    }

    pub fn node_state(&self, id: NodeId) -> NodeState {
        self.with_node(id, TaskGraphNode::state)
    }

    /// Predecessors of `id` that have not completed in the current frame.
    pub fn outstanding_predecessors(&self, id: NodeId) -> u32 {
        self.with_node(id, |node| node.predecessor_count.load(Ordering::Acquire))
    }

    pub fn predecessors(&self, id: NodeId) -> Vec<NodeId> {
        self.with_node(id, |node| node.predecessors.clone())
    }

    pub fn successors(&self, id: NodeId) -> Vec<NodeId> {
        self.with_node(id, |node| node.successors.clone())
    }

    pub fn node_name(&self, id: NodeId) -> Option<String> {
        self.with_node(id, |node| node.name.as_deref().map(str::to_owned))
    }

    fn with_node<R>(&self, id: NodeId, f: impl FnOnce(&TaskGraphNode) -> R) -> R {
        let nodes = self.shared.nodes.read().unwrap_or_else(PoisonError::into_inner);
        match nodes.get(id.index()) {
            Some(node) => f(node),
            None => panic!("graph {} has no node {}", self.shared.name, id.index()),
        }
    }
}

impl std::fmt::Debug for TaskGraphProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraphProxy")
            .field("name", &self.shared.name)
            .field("nodes", &self.len())
            .field("frames", &self.frames_submitted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::PooledTaskScheduler;
    use std::sync::Mutex;

    /// A pool without threads; the test drains it by hand.
    fn manual() -> (Arc<PooledTaskScheduler>, TaskGraphProxy) {
        let scheduler = Arc::new(PooledTaskScheduler::new("manual"));
        let graph = TaskGraphProxy::new("manual", scheduler.clone());
        (scheduler, graph)
    }

    fn run_one(scheduler: &PooledTaskScheduler) -> Option<String> {
        let task = scheduler.next_queued_work()?;
        let name = task.name().map(str::to_owned);
        task.execute();
        name
    }

    #[test]
    fn test_diamond_state_machine() {
        let (scheduler, graph) = manual();
        let a = graph.push_fn("a", || {}, &[]);
        let b = graph.push_fn("b", || {}, &[a]);
        let c = graph.push_fn("c", || {}, &[a]);
        let d = graph.push_fn("d", || {}, &[b, c]);
        assert_eq!(graph.successors(a), vec![b, c]);
        assert_eq!(graph.predecessors(d), vec![b, c]);

        graph.submit();
        assert!(graph.is_in_flight());
        assert_eq!(graph.node_state(a), NodeState::Ready);
        assert_eq!(graph.node_state(d), NodeState::Wait);
        assert_eq!(graph.outstanding_predecessors(d), 2);

        assert_eq!(run_one(&scheduler).as_deref(), Some("a"));
        assert_eq!(graph.node_state(a), NodeState::Completed);
        assert_eq!(graph.node_state(b), NodeState::Ready);
        assert_eq!(graph.node_state(c), NodeState::Ready);

        assert_eq!(run_one(&scheduler).as_deref(), Some("b"));
        assert_eq!(graph.node_state(d), NodeState::Wait);
        assert_eq!(graph.outstanding_predecessors(d), 1);

        assert_eq!(run_one(&scheduler).as_deref(), Some("c"));
        assert_eq!(graph.node_state(d), NodeState::Ready);

        assert_eq!(run_one(&scheduler).as_deref(), Some("d"));
        assert!(!graph.is_in_flight());
        assert!(scheduler.is_empty_work());

        graph.reset();
        for node in [a, b, c, d] {
            assert_eq!(graph.node_state(node), NodeState::Wait);
            assert_eq!(graph.outstanding_predecessors(node), 0);
        }
    }

    #[test]
    fn test_replay_keeps_order_each_frame() {
        let (scheduler, graph) = manual();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut previous = vec![];
        for stage in ["physics", "cull", "tick"] {
            let log = Arc::clone(&log);
            let id = graph.push_fn(stage, move || log.lock().unwrap().push(stage), &previous);
            previous = vec![id];
        }

        for _ in 0..3 {
            graph.submit();
            while run_one(&scheduler).is_some() {}
            graph.reset();
        }
        assert_eq!(graph.frames_submitted(), 3);
        assert_eq!(
            *log.lock().unwrap(),
            ["physics", "cull", "tick"].repeat(3)
        );
    }

    #[test]
    fn test_wait_and_reset_clears_nodes() {
        let (scheduler, graph) = manual();
        graph.push_fn("only", || {}, &[]);
        graph.submit();
        while run_one(&scheduler).is_some() {}
        graph.wait_and_reset();
        assert!(graph.is_empty());

        // An empty graph submits as a no-op.
        graph.submit();
        assert!(!graph.is_in_flight());
    }

    #[test]
    fn test_duplicate_predecessors_count_once() {
        let (scheduler, graph) = manual();
        let a = graph.push_fn("a", || {}, &[]);
        let b = graph.push_fn("b", || {}, &[a, a]);
        assert_eq!(graph.predecessors(b), vec![a]);

        graph.submit();
        while run_one(&scheduler).is_some() {}
        assert_eq!(graph.node_state(b), NodeState::Completed);
        assert!(!graph.is_in_flight());
    }

    #[test]
    #[should_panic(expected = "has not been pushed")]
    fn test_unknown_predecessor_is_fatal() {
        let (_scheduler, graph) = manual();
        graph.push_fn("orphan", || {}, &[NodeId(3)]);
    }

    #[test]
    #[should_panic(expected = "while a frame is in flight")]
    fn test_push_during_frame_is_fatal() {
        let (_scheduler, graph) = manual();
        graph.push_fn("a", || {}, &[]);
        graph.submit();
        graph.push_fn("b", || {}, &[]);
    }

    #[test]
    #[should_panic(expected = "reset the graph first")]
    fn test_submit_without_reset_is_fatal() {
        let (scheduler, graph) = manual();
        graph.push_fn("a", || {}, &[]);
        graph.submit();
        while run_one(&scheduler).is_some() {}
        graph.submit();
    }

    #[test]
    #[should_panic(expected = "made ready while Ready")]
    fn test_ready_twice_is_fatal() {
        let (_scheduler, graph) = manual();
        let a = graph.push_fn("a", || {}, &[]);
        graph.submit();
        let nodes = graph.shared.nodes.read().unwrap();
        graph.shared.make_ready(&nodes, a);
    }
}
