//! Strand Frame - Main Entry Point

use anyhow::{Context, Result};
use strand_frame::run_frames;
use strand_sched::{SchedulerConfig, SchedulerContext};
use tracing_subscriber::EnvFilter;

const DEFAULT_FRAMES: u32 = 3;

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Parse command line for the frame count
    let frames = match std::env::args().nth(1) {
        Some(arg) => arg
            .parse::<u32>()
            .with_context(|| format!("invalid frame count {arg:?}"))?,
        None => DEFAULT_FRAMES,
    };

    let config = SchedulerConfig::from_env();
    tracing::info!(?config, frames, "starting Strand frame driver");

    let context = SchedulerContext::start_up(config).context("failed to start named threads")?;
    context
        .init_worker_threads()
        .context("failed to start worker threads")?;

    let report = run_frames(&context, frames).context("frame pipeline failed")?;
    for trace in &report.frames {
        tracing::info!(frame = trace.frame, stages = ?trace.stages, "frame");
    }
    if !report.is_complete() {
        tracing::warn!("some frames ran out of pipeline order");
    }

    context.shut_down();
    Ok(())
}
