//! Frame Pacing
//!
//! Frame counters for the three pipeline stages and the two mutex+condvar
//! pairs that keep each stage at most one frame behind its producer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};

/// Stage counters
///
/// `game` counts frames started by the game thread; `render` and `rhi` count
/// frames their stage has finished.
#[derive(Debug, Default)]
pub struct FrameState {
    game: AtomicU32,
    render: AtomicU32,
    rhi: AtomicU32,
    game_render: Mutex<()>,
    game_render_cv: Condvar,
    render_rhi: Mutex<()>,
    render_rhi_cv: Condvar,
    max_render_lag: AtomicU32,
    max_rhi_lag: AtomicU32,
}

impl FrameState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the next game frame and return its number (from 1).
    pub fn begin_game_frame(&self) -> u32 {
        self.game.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn game_frame(&self) -> u32 {
        self.game.load(Ordering::Acquire)
    }

    pub fn render_frame(&self) -> u32 {
        self.render.load(Ordering::Acquire)
    }

    pub fn rhi_frame(&self) -> u32 {
        self.rhi.load(Ordering::Acquire)
    }

    /// Game side: block while the render stage is more than one frame behind.
    pub fn wait_for_render(&self) {
        let guard = self.game_render.lock().unwrap_or_else(PoisonError::into_inner);
        let _guard = self
            .game_render_cv
            .wait_while(guard, |_| self.render_lag() > 1)
            .unwrap_or_else(PoisonError::into_inner);
        self.max_render_lag.fetch_max(self.render_lag(), Ordering::Relaxed);
    }

    /// Render side: block while the RHI stage is more than one frame behind.
    pub fn wait_for_rhi(&self) {
        let guard = self.render_rhi.lock().unwrap_or_else(PoisonError::into_inner);
        let _guard = self
            .render_rhi_cv
            .wait_while(guard, |_| self.rhi_lag() > 1)
            .unwrap_or_else(PoisonError::into_inner);
        self.max_rhi_lag.fetch_max(self.rhi_lag(), Ordering::Relaxed);
    }

    /// A render frame finished; wake the game thread.
    pub fn end_render_frame(&self) -> u32 {
        let _guard = self.game_render.lock().unwrap_or_else(PoisonError::into_inner);
        let frame = self.render.fetch_add(1, Ordering::AcqRel) + 1;
        self.game_render_cv.notify_all();
        frame
    }

    /// An RHI frame was presented; wake the render thread.
    pub fn end_rhi_frame(&self) -> u32 {
        let _guard = self.render_rhi.lock().unwrap_or_else(PoisonError::into_inner);
        let frame = self.rhi.fetch_add(1, Ordering::AcqRel) + 1;
        self.render_rhi_cv.notify_all();
        frame
    }

    /// Block until the render stage has finished `frame`.
    pub fn wait_until_rendered(&self, frame: u32) {
        let guard = self.game_render.lock().unwrap_or_else(PoisonError::into_inner);
        let _guard = self
            .game_render_cv
            .wait_while(guard, |_| self.render_frame() < frame)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Block until `frame` has been presented.
    pub fn wait_until_presented(&self, frame: u32) {
        let guard = self.render_rhi.lock().unwrap_or_else(PoisonError::into_inner);
        let _guard = self
            .render_rhi_cv
            .wait_while(guard, |_| self.rhi_frame() < frame)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Largest game-to-render lag seen after pacing.
    pub fn max_render_lag(&self) -> u32 {
        self.max_render_lag.load(Ordering::Relaxed)
    }

    /// Largest render-to-RHI lag seen after pacing.
    pub fn max_rhi_lag(&self) -> u32 {
        self.max_rhi_lag.load(Ordering::Relaxed)
    }

    fn render_lag(&self) -> u32 {
        self.game_frame().saturating_sub(self.render_frame())
    }

    fn rhi_lag(&self) -> u32 {
        self.render_frame().saturating_sub(self.rhi_frame())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_game_waits_for_render() {
        let state = Arc::new(FrameState::new());
        state.begin_game_frame();
        state.wait_for_render();
        state.begin_game_frame();

        let waiter = {
            let state = Arc::clone(&state);
            thread::spawn(move || state.wait_for_render())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        state.end_render_frame();
        waiter.join().unwrap();
        assert_eq!(state.max_render_lag(), 1);
    }

    #[test]
    fn test_presented_wakes_driver() {
        let state = Arc::new(FrameState::new());
        let driver = {
            let state = Arc::clone(&state);
            thread::spawn(move || state.wait_until_presented(2))
        };
        state.end_rhi_frame();
        state.end_rhi_frame();
        driver.join().unwrap();
        assert_eq!(state.rhi_frame(), 2);
    }
}
