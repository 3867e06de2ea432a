//! Strand Frame
//!
//! Game/Render/RHI frame pipelining on top of `strand-sched`.
//!
//! # Example
//! ```rust,no_run
//! use strand_frame::{SimulatedCosts, run_frames_with};
//! use strand_sched::{SchedulerConfig, SchedulerContext};
//!
//! let context = SchedulerContext::start_up(SchedulerConfig::default())?;
//! context.init_worker_threads()?;
//! let report = run_frames_with(&context, 3, SimulatedCosts::instant())?;
//! assert!(report.is_complete());
//! context.shut_down();
//! # Ok::<(), strand_sched::SchedError>(())
//! ```

mod pipeline;
pub mod state;
pub mod tasks;

pub use pipeline::{FrameReport, FrameTrace, run_frames, run_frames_with};
pub use state::FrameState;
pub use tasks::{
    AddMeshBatch, FrameLog, PopulateCommandList, SimulatedCosts, SimulatedCull, SimulatedPhysics,
    SimulatedTick, Stage, busy_wait,
};
