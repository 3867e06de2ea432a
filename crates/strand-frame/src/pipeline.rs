//! Frame Pipeline
//!
//! The game thread runs a self-rescheduling task. Each run simulates one
//! frame through a reused task graph (physics, cull, tick) on the sync
//! workers, then hands the frame to the render thread. The render thread
//! fans mesh batches out to the sync workers; the last one pushes the RHI
//! stage to the RHI thread, which fans out command lists and presents.

use std::collections::BTreeMap;
use std::sync::Arc;

use strand_sched::{
    CompletionCounter, Event, PooledTaskScheduler, PushContinuation, Result, Scheduler,
    SchedulerContext, SingleScheduler, Task, TaskGraphProxy, Work,
};

use crate::state::FrameState;
use crate::tasks::{
    AddMeshBatch, FrameLog, PopulateCommandList, SimulatedCosts, SimulatedCull, SimulatedPhysics,
    SimulatedTick, Stage,
};

/// Stages one frame went through, in execution order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameTrace {
    pub frame: u32,
    pub stages: Vec<Stage>,
}

impl FrameTrace {
    /// Every stage ran exactly once, in pipeline order.
    pub fn is_complete(&self) -> bool {
        self.stages == Stage::PIPELINE
    }
}

/// Outcome of [`run_frames`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameReport {
    pub frames: Vec<FrameTrace>,
    pub max_render_lag: u32,
    pub max_rhi_lag: u32,
}

impl FrameReport {
    fn from_log(log: &FrameLog, state: &FrameState) -> Self {
        let mut by_frame: BTreeMap<u32, Vec<Stage>> = BTreeMap::new();
        for (frame, stage) in log.entries() {
            by_frame.entry(frame).or_default().push(stage);
        }
        Self {
            frames: by_frame
                .into_iter()
                .map(|(frame, stages)| FrameTrace { frame, stages })
                .collect(),
            max_render_lag: state.max_render_lag(),
            max_rhi_lag: state.max_rhi_lag(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.frames.iter().all(FrameTrace::is_complete)
    }
}

/// Everything the three stages share.
struct Pipeline {
    state: Arc<FrameState>,
    log: Arc<FrameLog>,
    costs: SimulatedCosts,
    exit_frame: u32,
    exit: Event,
    game_graph: TaskGraphProxy,
    game: Arc<SingleScheduler>,
    render: Arc<SingleScheduler>,
    rhi: Arc<SingleScheduler>,
    sync_workers: Arc<PooledTaskScheduler>,
}

struct GameTask {
    pipeline: Arc<Pipeline>,
}

impl Work for GameTask {
    fn do_work(&mut self) {
        let p = &self.pipeline;
        let frame = p.state.begin_game_frame();
        tracing::debug!(frame, "game frame");

        p.game_graph.submit();
        p.game_graph.reset();

        p.state.wait_for_render();
        p.render.push_task(Task::from_work(RenderTask {
            pipeline: Arc::clone(p),
            frame,
        }));

        if frame >= p.exit_frame {
            tracing::info!(frame, "exit frame reached");
            p.exit.trigger();
        } else {
            p.game.push_task(Task::from_work(GameTask {
                pipeline: Arc::clone(p),
            }));
        }
    }

    fn name(&self) -> Option<&str> {
        Some("game")
    }
}

struct RenderTask {
    pipeline: Arc<Pipeline>,
    frame: u32,
}

impl Work for RenderTask {
    fn do_work(&mut self) {
        let p = &self.pipeline;
        // Mesh batches of the previous frame must land first so RHI frames
        // are pushed in order.
        p.state.wait_until_rendered(self.frame - 1);
        p.state.wait_for_rhi();
        tracing::debug!(frame = self.frame, "render frame");
        p.log.record(self.frame, Stage::Render);

        let rhi_task = Task::from_work(RhiTask {
            pipeline: Arc::clone(p),
            frame: self.frame,
        });
        let counter = Arc::new(CompletionCounter::new(PushContinuation::new(
            p.rhi.clone(),
            rhi_task,
        )));
        fan_out(p, &counter, |counter| {
            Task::from_work(AddMeshBatch::new(counter, p.costs.job))
        });
    }

    fn name(&self) -> Option<&str> {
        Some("render")
    }
}

struct RhiTask {
    pipeline: Arc<Pipeline>,
    frame: u32,
}

impl Work for RhiTask {
    fn do_work(&mut self) {
        let p = &self.pipeline;
        // Every mesh batch of this frame is in.
        p.state.end_render_frame();
        tracing::debug!(frame = self.frame, "rhi frame");
        p.log.record(self.frame, Stage::Rhi);
        p.state.wait_until_presented(self.frame - 1);

        let state = Arc::clone(&p.state);
        let frame = self.frame;
        let counter = Arc::new(CompletionCounter::new(move || {
            let presented = state.end_rhi_frame();
            debug_assert_eq!(presented, frame);
            tracing::debug!(frame, "present");
        }));
        fan_out(p, &counter, |counter| {
            Task::from_work(PopulateCommandList::new(counter, p.costs.job))
        });
    }

    fn name(&self) -> Option<&str> {
        Some("rhi")
    }
}

/// Push `jobs_per_frame` jobs to the sync workers, all notifying `counter`.
///
/// With no jobs the counter's hook runs on the calling thread.
fn fan_out<H, F>(pipeline: &Pipeline, counter: &Arc<CompletionCounter<H>>, make_job: F)
where
    H: strand_sched::OnCompleted,
    F: Fn(Arc<CompletionCounter<H>>) -> Task,
{
    let jobs = pipeline.costs.jobs_per_frame;
    if jobs == 0 {
        counter.promise(1);
        counter.notify();
        return;
    }
    counter.promise(jobs as i32);
    for _ in 0..jobs {
        pipeline.sync_workers.push_task(make_job(Arc::clone(counter)));
    }
}

/// Drive `frames` frames through the pipeline with the default costs.
pub fn run_frames(context: &SchedulerContext, frames: u32) -> Result<FrameReport> {
    run_frames_with(context, frames, SimulatedCosts::default())
}

/// Drive `frames` frames through the pipeline and block until the last one
/// is presented.
///
/// Needs the context's worker threads; must be called from outside the
/// context's threads.
pub fn run_frames_with(
    context: &SchedulerContext,
    frames: u32,
    costs: SimulatedCosts,
) -> Result<FrameReport> {
    let sync_workers = Arc::clone(context.sync_workers()?);
    let state = Arc::new(FrameState::new());
    let log = Arc::new(FrameLog::new());
    if frames == 0 {
        return Ok(FrameReport::from_log(&log, &state));
    }

    let game_graph = TaskGraphProxy::new("game", sync_workers.clone() as Arc<dyn Scheduler>);
    let physics = game_graph.push_task(
        SimulatedPhysics::new(Arc::clone(&state), Arc::clone(&log), costs.physics),
        &[],
    );
    let cull = game_graph.push_task(
        SimulatedCull::new(Arc::clone(&state), Arc::clone(&log), costs.cull),
        &[physics],
    );
    game_graph.push_task(
        SimulatedTick::new(Arc::clone(&state), Arc::clone(&log), costs.tick),
        &[cull],
    );

    let pipeline = Arc::new(Pipeline {
        state: Arc::clone(&state),
        log: Arc::clone(&log),
        costs,
        exit_frame: frames,
        exit: Event::new(),
        game_graph,
        game: Arc::clone(context.game_scheduler()),
        render: Arc::clone(context.render_scheduler()),
        rhi: Arc::clone(context.rhi_scheduler()),
        sync_workers,
    });

    tracing::info!(frames, "running frame pipeline");
    pipeline.game.push_task(Task::from_work(GameTask {
        pipeline: Arc::clone(&pipeline),
    }));
    pipeline.exit.wait();
    state.wait_until_presented(frames);

    let report = FrameReport::from_log(&log, &state);
    tracing::info!(
        frames = report.frames.len(),
        max_render_lag = report.max_render_lag,
        max_rhi_lag = report.max_rhi_lag,
        "frame pipeline finished"
    );
    Ok(report)
}
