//! Simulated Frame Work
//!
//! Stand-ins for the engine's real per-frame work. Each burns a fixed amount
//! of CPU time and records which stage of which frame ran.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use strand_sched::{CompletionCounter, OnCompleted, Work};

use crate::state::FrameState;

/// Pipeline stage recorded in the frame log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Physics,
    Cull,
    Tick,
    Render,
    Rhi,
}

impl Stage {
    /// Order every frame must record its stages in.
    pub const PIPELINE: [Stage; 5] = [
        Stage::Physics,
        Stage::Cull,
        Stage::Tick,
        Stage::Render,
        Stage::Rhi,
    ];
}

/// Shared, append-only record of `(frame, stage)` in execution order.
#[derive(Debug, Default)]
pub struct FrameLog {
    entries: Mutex<Vec<(u32, Stage)>>,
}

impl FrameLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, frame: u32, stage: Stage) {
        tracing::trace!(frame, ?stage, "stage executed");
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((frame, stage));
    }

    pub fn entries(&self) -> Vec<(u32, Stage)> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Spin for `duration` without yielding the thread.
pub fn busy_wait(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        std::hint::spin_loop();
    }
}

/// CPU cost of each simulated piece of work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatedCosts {
    pub physics: Duration,
    pub cull: Duration,
    pub tick: Duration,
    /// Cost of one render or RHI fan-out job
    pub job: Duration,
    /// Fan-out jobs per render and per RHI frame
    pub jobs_per_frame: u32,
}

impl Default for SimulatedCosts {
    fn default() -> Self {
        Self {
            physics: Duration::from_micros(1000),
            cull: Duration::from_micros(1000),
            tick: Duration::from_micros(1000),
            job: Duration::from_micros(50),
            jobs_per_frame: 1000,
        }
    }
}

impl SimulatedCosts {
    /// Near-zero costs for tests.
    pub fn instant() -> Self {
        Self {
            physics: Duration::ZERO,
            cull: Duration::ZERO,
            tick: Duration::ZERO,
            job: Duration::ZERO,
            jobs_per_frame: 16,
        }
    }
}

// ============================================================================
// Game graph nodes
// ============================================================================

macro_rules! simulated_stage {
    ($(#[$doc:meta])* $name:ident, $stage:expr, $label:literal) => {
        $(#[$doc])*
        pub struct $name {
            state: Arc<FrameState>,
            log: Arc<FrameLog>,
            cost: Duration,
        }

        impl $name {
            pub fn new(state: Arc<FrameState>, log: Arc<FrameLog>, cost: Duration) -> Self {
                Self { state, log, cost }
            }
        }

        impl Work for $name {
            fn do_work(&mut self) {
                busy_wait(self.cost);
                self.log.record(self.state.game_frame(), $stage);
            }

            fn name(&self) -> Option<&str> {
                Some($label)
            }
        }
    };
}

simulated_stage!(
    /// Physics step, first node of the game graph.
    SimulatedPhysics,
    Stage::Physics,
    "physics"
);
simulated_stage!(
    /// Visibility culling, after physics.
    SimulatedCull,
    Stage::Cull,
    "cull"
);
simulated_stage!(
    /// Gameplay tick, after culling.
    SimulatedTick,
    Stage::Tick,
    "tick"
);

// ============================================================================
// Render and RHI fan-out jobs
// ============================================================================

/// Render-side fan-out job; notifies its counter when done.
pub struct AddMeshBatch<H: OnCompleted> {
    counter: Arc<CompletionCounter<H>>,
    cost: Duration,
}

impl<H: OnCompleted> AddMeshBatch<H> {
    pub fn new(counter: Arc<CompletionCounter<H>>, cost: Duration) -> Self {
        Self { counter, cost }
    }
}

impl<H: OnCompleted + 'static> Work for AddMeshBatch<H> {
    fn do_work(&mut self) {
        busy_wait(self.cost);
        self.counter.notify();
    }

    fn name(&self) -> Option<&str> {
        Some("add-mesh-batch")
    }
}

/// RHI-side fan-out job; notifies its counter when done.
pub struct PopulateCommandList<H: OnCompleted> {
    counter: Arc<CompletionCounter<H>>,
    cost: Duration,
}

impl<H: OnCompleted> PopulateCommandList<H> {
    pub fn new(counter: Arc<CompletionCounter<H>>, cost: Duration) -> Self {
        Self { counter, cost }
    }
}

impl<H: OnCompleted + 'static> Work for PopulateCommandList<H> {
    fn do_work(&mut self) {
        busy_wait(self.cost);
        self.counter.notify();
    }

    fn name(&self) -> Option<&str> {
        Some("populate-command-list")
    }
}
