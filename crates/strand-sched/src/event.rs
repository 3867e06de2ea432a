//! Wake Event
//!
//! Auto-reset event: `trigger` latches a signal, the next `wait` consumes it.
//! A trigger that lands while nobody is waiting is not lost.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct Event {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the signal and wake a waiter.
    pub fn trigger(&self) {
        let mut signaled = self.signaled.lock().unwrap_or_else(PoisonError::into_inner);
        *signaled = true;
        self.condvar.notify_all();
    }

    /// Block until triggered, then consume the signal.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap_or_else(PoisonError::into_inner);
        while !*signaled {
            signaled = self
                .condvar
                .wait(signaled)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *signaled = false;
    }

    /// Like [`wait`](Self::wait) with a deadline; `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.signaled.lock().unwrap_or_else(PoisonError::into_inner);
        while !*signaled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            signaled = self
                .condvar
                .wait_timeout(signaled, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *signaled = false;
        true
    }

    /// Drop a pending signal.
    pub fn reset(&self) {
        *self.signaled.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    pub fn is_triggered(&self) -> bool {
        *self.signaled.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
